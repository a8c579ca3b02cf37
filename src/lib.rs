pub mod imds;
pub mod metering;
pub mod plugin;
pub mod submitter;

pub use imds::{AccountInfo, ImdsTransport, MetadataError, MetadataResolver};
pub use metering::{ClientError, MarketplaceMetering, MeteringClient};
pub use plugin::{
    get_account_info, get_csp_name, get_version, meter_billing, setup_adapter, Config, PluginError,
};
pub use submitter::{BillingSubmitter, DimensionOutcome, UsageDimensions};
