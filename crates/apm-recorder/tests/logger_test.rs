// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use apm_recorder::{logger, Config};

// The global subscriber can only be claimed once per process, so this lives
// in its own test binary.
#[test]
fn init_installs_global_subscriber_once() {
    let config = Config {
        log_level: "debug".to_string(),
        ..Config::default()
    };
    assert!(logger::init(&config));
    assert!(tracing::dispatcher::has_been_set());
    assert!(!logger::init(&config));
}
