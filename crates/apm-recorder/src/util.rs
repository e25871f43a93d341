// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as fractional seconds since the Unix epoch.
///
/// A clock set before the epoch yields `0.0`.
pub fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}

/// Short transaction guid: the first 16 hex digits of a v4 uuid.
pub fn generate_guid() -> String {
    let mut guid = uuid::Uuid::new_v4().simple().to_string();
    guid.truncate(16);
    guid
}
