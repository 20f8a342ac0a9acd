// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Runtime tunables for the dispatcher (spec.md §6.4).

use std::time::Duration;

/// Compile-time default for the temp-connection hard cap.
pub const DEFAULT_MAX_TMP_CONN: usize = 1024;

/// Periodic aging sweep interval, matching spec.md's `AGE_PERIOD = 6 * 60 s`.
pub const AGE_PERIOD: Duration = Duration::from_secs(6 * 60);

/// If the per-service lock can't be taken without blocking during a sweep,
/// retry after this long.
pub const AGE_RETRY: Duration = Duration::from_secs(1);

/// Worker upcall wait ceiling when other threads are idle (lots of spare
/// capacity, be patient for cache lookups).
pub const THREAD_WAIT_IDLE: Duration = Duration::from_secs(5);

/// Worker upcall wait ceiling when capacity is tight (abandon slow upcalls
/// sooner).
pub const THREAD_WAIT_BUSY: Duration = Duration::from_secs(1);

/// Configuration for a [`crate::Dispatcher`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum outstanding requests per connection; `0` means unlimited.
    pub per_connection_limit: u32,
    /// Hard cap on concurrently live temporary (accepted) transports.
    pub max_tmp_conn: usize,
    /// How often the aging sweep runs per service.
    pub age_period: Duration,
    /// Number of scheduling pools (one per CPU/NUMA node is typical).
    pub pool_count: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            per_connection_limit: 0,
            max_tmp_conn: DEFAULT_MAX_TMP_CONN,
            age_period: AGE_PERIOD,
            pool_count: 1,
        }
    }
}
