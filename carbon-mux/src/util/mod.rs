// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod cancellation;
pub mod framed;

/// Routes `tracing` output of a test run to the test harness, filtered by `RUST_LOG`
#[cfg(test)]
pub(crate) fn test_logging() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("carbon_mux=debug"));
  tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_test_writer()
    .try_init()
    .ok();
}
