// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::config::StreamingConfig;
use crate::transport::{Metadata, LICENSE_KEY};

const RUN_TOKEN: &str = "agent_run_token";
const FLAKY: &str = "flaky";
const FLAKY_CODE: &str = "flaky_code";
const DELAY: &str = "delay";
const COMPRESSION: &str = "grpc-internal-encoding-request";

/// Identity of the agent session the stream belongs to.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub license_key: String,
    pub run_token: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("license_key", &crate::transport::obfuscate(&self.license_key))
            .field("run_token", &self.run_token)
            .finish()
    }
}

/// Metadata sent with channel and stream creation.
///
/// User supplied headers are added with lower-cased names and untouched
/// values; they never replace the license key or run token.
pub fn build_metadata(config: &StreamingConfig, credentials: &Credentials) -> Metadata {
    let mut metadata = Metadata::new();

    for (name, value) in &config.request_headers {
        metadata.insert(name.to_lowercase(), value.clone());
    }

    metadata.insert(LICENSE_KEY, credentials.license_key.clone());
    metadata.insert(RUN_TOKEN, credentials.run_token.clone());

    if let Some(flaky) = config.flaky {
        metadata.insert(FLAKY, flaky.to_string());
    }
    if let Some(code) = config.flaky_code {
        metadata.insert(FLAKY_CODE, code.to_string());
    }
    if let Some(delay) = config.delay_ms {
        metadata.insert(DELAY, delay.to_string());
    }
    if config.compression {
        metadata.insert(COMPRESSION, "gzip");
    }

    metadata
}
