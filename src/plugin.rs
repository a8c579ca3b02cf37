//! The hook functions the host adapter discovers and calls. This
//! handles the metered billing of product usage in the AWS
//! Marketplace.

use crate::imds::{AccountInfo, MetadataError, MetadataResolver, CSP_NAME};
use crate::metering::ClientError;
use crate::submitter::{BillingSubmitter, DimensionOutcome, UsageDimensions};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;

/// Adapter configuration as far as this plugin consumes it. Loading is
/// owned by the host adapter.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub product_code: String,
}

/// Total inability to address the billing endpoint. Per-dimension
/// failures are reported as data, never through this type.
#[derive(Error, Debug)]
pub enum PluginError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Handle any plugin specific setup at adapter start.
pub fn setup_adapter(_config: &Config) {}

/// Return CSP provider name.
pub fn get_csp_name(_config: &Config) -> &'static str {
    CSP_NAME
}

/// Return plugin name and version.
pub fn get_version() -> (&'static str, &'static str) {
    (env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

/// Process a metered billing based on the dimensions provided.
///
/// Resolves the region, then submits every dimension and returns one
/// outcome per dimension. A customer identifier switches submission to
/// one batch call; without it every dimension is metered with its own
/// single-record call. Only a failure to address the billing endpoint
/// (metadata or client construction) is an error.
pub fn meter_billing(
    config: &Config,
    dimensions: &UsageDimensions,
    timestamp: DateTime<Utc>,
    dry_run: bool,
    customer_identifier: Option<&str>,
) -> Result<HashMap<String, DimensionOutcome>, PluginError> {
    let region = MetadataResolver::new().resolve_region()?;
    let mut submitter = BillingSubmitter::new(&config.product_code, &region)?;
    Ok(submitter.submit(dimensions, timestamp, dry_run, customer_identifier))
}

/// Return account information from the instance metadata service.
pub fn get_account_info(_config: &Config) -> Result<AccountInfo, MetadataError> {
    MetadataResolver::new().fetch_account_info()
}
