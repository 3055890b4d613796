/*
Copyright 2026  The Virtqueue Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! A process-wide `log` backend that records what the virtqueue crate logs, so
//! tests can assert on it.

use std::sync::{Mutex, MutexGuard, Once};
use std::thread::current;

use log::{Level, Log, Metadata, Record, set_logger, set_max_level};

use crate::LOG_TARGET_PREFIX;

pub static LOGGER: SimpleLogger = SimpleLogger {};
static INITLOGGER: Once = Once::new();

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct LogCall {
    pub level: Level,
    pub args: String,
    pub target: String,
    pub line: Option<u32>,
    pub module_path: Option<String>,
}

static LOGCALLS: Mutex<Vec<LogCall>> = Mutex::new(Vec::new());

fn calls() -> MutexGuard<'static, Vec<LogCall>> {
    // a test that panicked while holding the lock must not hide later records
    LOGCALLS.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct SimpleLogger {}

impl SimpleLogger {
    /// Install the logger. Safe to call from every test.
    pub fn initialize_test_logger() {
        INITLOGGER.call_once(|| {
            set_logger(&LOGGER).unwrap();
            set_max_level(log::LevelFilter::Trace);
        });
    }

    pub fn num_log_calls(&self) -> usize {
        calls().len()
    }

    pub fn get_log_call(&self, idx: usize) -> Option<LogCall> {
        calls().get(idx).cloned()
    }

    /// Records at exactly `level`.
    pub fn calls_at(&self, level: Level) -> Vec<LogCall> {
        calls().iter().filter(|c| c.level == level).cloned().collect()
    }

    pub fn clear_log_calls(&self) {
        calls().clear();
    }

    /// Run `f` over the recorded calls, then forget them.
    pub fn test_log_records<F: Fn(&Vec<LogCall>)>(&self, f: F) {
        let mut logcalls = calls();
        f(&logcalls);
        logcalls.clear();
    }
}

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.target().starts_with(LOG_TARGET_PREFIX) && metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        calls().push(LogCall {
            level: record.level(),
            args: record.args().to_string(),
            target: record.target().to_string(),
            line: record.line(),
            module_path: record.module_path().map(str::to_string),
        });

        println!("Thread {:?} {:?}", current().id(), record);
    }

    fn flush(&self) {}
}
