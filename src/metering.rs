//! This module provides an abstraction over the AWS Marketplace
//! metering service in order to allow client code to instantiate the
//! client implementation they want without depending on the AWS SDK
//! directly.
//!
//! It also simplify unit tests.

use aws_config::{BehaviorVersion, Region};
use aws_sdk_marketplacemetering::error::DisplayErrorContext;
use aws_sdk_marketplacemetering::primitives::DateTime as SdkDateTime;
use aws_sdk_marketplacemetering::types as sdk_types;
use aws_sdk_marketplacemetering::Client;
use chrono::{DateTime, TimeZone, Utc};
#[cfg(test)]
use std::cell::RefCell;
#[cfg(test)]
use std::collections::{HashMap, VecDeque};
#[cfg(test)]
use std::rc::Rc;
use thiserror::Error;
use tracing::{event, Level};

/// A single-record metering call, one dimension at a time.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterUsageRequest {
    pub product_code: String,
    pub timestamp: DateTime<Utc>,
    pub dimension: String,
    pub quantity: u64,
    pub dry_run: bool,
}

/// One usage record of a batch call. The batch operation has no
/// dry-run flag.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub customer_identifier: String,
    pub dimension: String,
    pub quantity: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchMeterUsageRequest {
    pub product_code: String,
    pub records: Vec<UsageRecord>,
}

/// Status reported by the remote service for one record of a batch
/// call. `DuplicateRecord` and `Other` exist so the response shape is
/// covered exhaustively; the submitter reports both as an unknown
/// status.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordStatus {
    Success,
    CustomerNotSubscribed,
    DuplicateRecord,
    Other(String),
}

/// One entry of the successful-results list of a batch response.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecordResult {
    pub record: UsageRecord,
    pub metering_record_id: Option<String>,
    pub status: Option<RecordStatus>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchMeterUsageResponse {
    pub results: Vec<UsageRecordResult>,
    pub unprocessed: Vec<UsageRecord>,
}

/// Metering client errors.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The remote call did not complete.
    #[error("metering request failed: {0}")]
    Transport(String),

    /// A usage record could not be expressed in the remote contract.
    #[error("invalid usage record: {0}")]
    InvalidRecord(String),

    /// The region-bound client could not be constructed.
    #[error("failed to initialize metering client: {0}")]
    Init(String),
}

/// A basic metering client trait.
///
/// The submitter owns retry and response reduction; implementations
/// only perform one remote call per method invocation.
pub trait MeteringClient {
    fn meter_usage(&mut self, request: &MeterUsageRequest) -> Result<Option<String>, ClientError>;

    fn batch_meter_usage(
        &mut self,
        request: &BatchMeterUsageRequest,
    ) -> Result<BatchMeterUsageResponse, ClientError>;
}

/// Client backed by the AWS SDK, addressed at the metering endpoint of
/// one region. The SDK is async; calls are driven to completion on a
/// private current-thread runtime so the trait stays synchronous.
pub struct MarketplaceMetering {
    runtime: tokio::runtime::Runtime,
    client: Client,
}

impl MarketplaceMetering {
    pub fn new(region: &str) -> Result<MarketplaceMetering, ClientError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|error| ClientError::Init(error.to_string()))?;
        let config = runtime.block_on(
            aws_config::defaults(BehaviorVersion::latest())
                .region(Region::new(region.to_owned()))
                .load(),
        );
        let client = Client::new(&config);
        Ok(MarketplaceMetering { runtime, client })
    }
}

impl MeteringClient for MarketplaceMetering {
    fn meter_usage(&mut self, request: &MeterUsageRequest) -> Result<Option<String>, ClientError> {
        let quantity = quantity_for_wire(request.quantity)?;
        let output = self
            .runtime
            .block_on(
                self.client
                    .meter_usage()
                    .product_code(&request.product_code)
                    .timestamp(SdkDateTime::from_secs(request.timestamp.timestamp()))
                    .usage_dimension(&request.dimension)
                    .usage_quantity(quantity)
                    .dry_run(request.dry_run)
                    .send(),
            )
            .map_err(|error| ClientError::Transport(DisplayErrorContext(&error).to_string()))?;

        event!(Level::DEBUG, "Metered dimension {}.", request.dimension);
        Ok(output.metering_record_id().map(str::to_string))
    }

    fn batch_meter_usage(
        &mut self,
        request: &BatchMeterUsageRequest,
    ) -> Result<BatchMeterUsageResponse, ClientError> {
        let mut records = Vec::with_capacity(request.records.len());
        for record in &request.records {
            records.push(to_sdk_record(record)?);
        }

        let output = self
            .runtime
            .block_on(
                self.client
                    .batch_meter_usage()
                    .product_code(&request.product_code)
                    .set_usage_records(Some(records))
                    .send(),
            )
            .map_err(|error| ClientError::Transport(DisplayErrorContext(&error).to_string()))?;

        let results = output
            .results()
            .iter()
            .filter_map(|result| {
                let record = from_sdk_record(result.usage_record()?);
                Some(UsageRecordResult {
                    record,
                    metering_record_id: result.metering_record_id().map(str::to_string),
                    status: result.status().map(status_from_sdk),
                })
            })
            .collect();
        let unprocessed = output
            .unprocessed_records()
            .iter()
            .map(from_sdk_record)
            .collect();

        Ok(BatchMeterUsageResponse {
            results,
            unprocessed,
        })
    }
}

fn quantity_for_wire(quantity: u64) -> Result<i32, ClientError> {
    i32::try_from(quantity).map_err(|_| {
        ClientError::InvalidRecord(format!(
            "quantity {quantity} exceeds the range accepted by the metering service"
        ))
    })
}

fn to_sdk_record(record: &UsageRecord) -> Result<sdk_types::UsageRecord, ClientError> {
    sdk_types::UsageRecord::builder()
        .timestamp(SdkDateTime::from_secs(record.timestamp.timestamp()))
        .customer_identifier(&record.customer_identifier)
        .dimension(&record.dimension)
        .quantity(quantity_for_wire(record.quantity)?)
        .build()
        .map_err(|error| ClientError::InvalidRecord(error.to_string()))
}

fn from_sdk_record(record: &sdk_types::UsageRecord) -> UsageRecord {
    UsageRecord {
        timestamp: Utc
            .timestamp_opt(record.timestamp().secs(), 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC),
        customer_identifier: record.customer_identifier().to_string(),
        dimension: record.dimension().to_string(),
        quantity: record.quantity().unwrap_or(0).max(0) as u64,
    }
}

fn status_from_sdk(status: &sdk_types::UsageRecordResultStatus) -> RecordStatus {
    use sdk_types::UsageRecordResultStatus as Status;

    match status {
        Status::Success => RecordStatus::Success,
        Status::CustomerNotSubscribed => RecordStatus::CustomerNotSubscribed,
        Status::DuplicateRecord => RecordStatus::DuplicateRecord,
        other => RecordStatus::Other(other.as_str().to_string()),
    }
}

/// Test double with per-dimension scripts. Single-record responses are
/// keyed by dimension name so tests do not depend on map iteration
/// order; batch responses are consumed in call order.
#[cfg(test)]
pub(crate) struct ScriptedClient {
    meter_scripts: HashMap<String, VecDeque<Result<Option<String>, ClientError>>>,
    batch_scripts: VecDeque<Result<BatchMeterUsageResponse, ClientError>>,
    meter_requests: Rc<RefCell<Vec<MeterUsageRequest>>>,
    batch_requests: Rc<RefCell<Vec<BatchMeterUsageRequest>>>,
}

#[cfg(test)]
impl ScriptedClient {
    pub fn new() -> ScriptedClient {
        ScriptedClient {
            meter_scripts: HashMap::new(),
            batch_scripts: VecDeque::new(),
            meter_requests: Rc::new(RefCell::new(Vec::new())),
            batch_requests: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn script_meter(
        mut self,
        dimension: &str,
        responses: Vec<Result<Option<String>, ClientError>>,
    ) -> ScriptedClient {
        self.meter_scripts
            .insert(dimension.to_string(), responses.into());
        self
    }

    pub fn script_batch(
        mut self,
        response: Result<BatchMeterUsageResponse, ClientError>,
    ) -> ScriptedClient {
        self.batch_scripts.push_back(response);
        self
    }

    /// Handle on the recorded single-record requests, kept alive after
    /// the client is boxed away.
    pub fn meter_log(&self) -> Rc<RefCell<Vec<MeterUsageRequest>>> {
        Rc::clone(&self.meter_requests)
    }

    pub fn batch_log(&self) -> Rc<RefCell<Vec<BatchMeterUsageRequest>>> {
        Rc::clone(&self.batch_requests)
    }
}

#[cfg(test)]
impl MeteringClient for ScriptedClient {
    fn meter_usage(&mut self, request: &MeterUsageRequest) -> Result<Option<String>, ClientError> {
        self.meter_requests.borrow_mut().push(request.clone());
        self.meter_scripts
            .get_mut(&request.dimension)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| panic!("no scripted response left for {}", request.dimension))
    }

    fn batch_meter_usage(
        &mut self,
        request: &BatchMeterUsageRequest,
    ) -> Result<BatchMeterUsageResponse, ClientError> {
        self.batch_requests.borrow_mut().push(request.clone());
        self.batch_scripts
            .pop_front()
            .expect("no scripted batch response left")
    }
}
