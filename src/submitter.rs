use crate::metering::{
    BatchMeterUsageRequest, BatchMeterUsageResponse, ClientError, MarketplaceMetering,
    MeterUsageRequest, MeteringClient, RecordStatus, UsageRecord, UsageRecordResult,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{event, Level};

/// Dimension name to usage quantity, supplied fresh on every call.
pub type UsageDimensions = HashMap<String, u64>;

/// Remote attempts per dimension (single-record mode) or per batch.
const METER_ATTEMPTS: u32 = 3;

/// Per-dimension result of a submission. Serializes to
/// `{"status": "submitted", "record_id": …}` or
/// `{"status": "failed", "error": …}`, which is the shape the host
/// adapter persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DimensionOutcome {
    Submitted {
        /// Identifier echoed by the metering service. The service may
        /// omit it; that is still a success.
        record_id: Option<String>,
    },
    Failed {
        #[serde(rename = "error")]
        message: String,
    },
}

/// This is the entry point for billing submission.
///
/// The BillingSubmitter turns a set of usage dimensions into metering
/// calls through an injected [`MeteringClient`] and reduces the remote
/// responses into one outcome per dimension. Failures past the retry
/// budget become `Failed` outcomes, never errors: the caller always
/// receives a complete report, one entry per requested dimension.
///
/// A submitter is cheap and stateless; build one per submission with
/// the region resolved for this invocation.
pub struct BillingSubmitter<'a> {
    product_code: String,
    client: Box<dyn MeteringClient + 'a>,
}

impl<'a> BillingSubmitter<'a> {
    /// Instantiates a BillingSubmitter addressing the metering service
    /// of the given region. This initialization method lets the
    /// submitter create the client and own it.
    pub fn new(product_code: &str, region: &str) -> Result<BillingSubmitter<'a>, ClientError> {
        Ok(BillingSubmitter::with_client(
            product_code,
            Box::new(MarketplaceMetering::new(region)?),
        ))
    }

    /// Leaves the responsibility to provide a client to the caller.
    /// Most of the times you should not need to use this.
    pub fn with_client(
        product_code: &str,
        client: Box<dyn MeteringClient + 'a>,
    ) -> BillingSubmitter<'a> {
        BillingSubmitter {
            product_code: product_code.to_string(),
            client,
        }
    }

    /// Submits all dimensions and reports one outcome each.
    ///
    /// Without a customer identifier every dimension is metered with
    /// its own single-record call and its own retry budget, so one
    /// stuck dimension cannot fail the others. With a customer
    /// identifier all dimensions go out as one batch call whose
    /// response carries per-record statuses.
    ///
    /// Dry-run is forwarded to single-record calls; the batch
    /// operation does not support it. Local behavior is identical
    /// either way.
    pub fn submit(
        &mut self,
        dimensions: &UsageDimensions,
        timestamp: DateTime<Utc>,
        dry_run: bool,
        customer_identifier: Option<&str>,
    ) -> HashMap<String, DimensionOutcome> {
        match customer_identifier {
            Some(customer_identifier) => {
                self.submit_batch(dimensions, timestamp, customer_identifier)
            }
            None => self.submit_each(dimensions, timestamp, dry_run),
        }
    }

    fn submit_each(
        &mut self,
        dimensions: &UsageDimensions,
        timestamp: DateTime<Utc>,
        dry_run: bool,
    ) -> HashMap<String, DimensionOutcome> {
        let mut outcomes = HashMap::new();
        for (dimension, quantity) in dimensions {
            let request = MeterUsageRequest {
                product_code: self.product_code.clone(),
                timestamp,
                dimension: dimension.clone(),
                quantity: *quantity,
                dry_run,
            };
            outcomes.insert(dimension.clone(), self.meter_one(&request));
        }
        outcomes
    }

    fn meter_one(&mut self, request: &MeterUsageRequest) -> DimensionOutcome {
        let mut last_error = String::new();
        for attempt in 1..=METER_ATTEMPTS {
            match self.client.meter_usage(request) {
                Ok(record_id) => return DimensionOutcome::Submitted { record_id },
                Err(error) => {
                    event!(
                        Level::WARN,
                        "Metering attempt {}/{} failed for dimension {}. {}",
                        attempt,
                        METER_ATTEMPTS,
                        request.dimension,
                        error
                    );
                    last_error = error.to_string();
                }
            }
        }
        event!(
            Level::ERROR,
            "Exhausted metering attempts for dimension {}.",
            request.dimension
        );
        DimensionOutcome::Failed {
            message: format!(
                "Failed to meter bill dimension {}: {last_error}",
                request.dimension
            ),
        }
    }

    fn submit_batch(
        &mut self,
        dimensions: &UsageDimensions,
        timestamp: DateTime<Utc>,
        customer_identifier: &str,
    ) -> HashMap<String, DimensionOutcome> {
        let records = dimensions
            .iter()
            .map(|(dimension, quantity)| UsageRecord {
                timestamp,
                customer_identifier: customer_identifier.to_string(),
                dimension: dimension.clone(),
                quantity: *quantity,
            })
            .collect();
        let request = BatchMeterUsageRequest {
            product_code: self.product_code.clone(),
            records,
        };

        let mut last_error = String::new();
        for attempt in 1..=METER_ATTEMPTS {
            match self.client.batch_meter_usage(&request) {
                Ok(response) => return self.reduce_batch(dimensions, response),
                Err(error) => {
                    event!(
                        Level::WARN,
                        "Batch metering attempt {}/{} failed. {}",
                        attempt,
                        METER_ATTEMPTS,
                        error
                    );
                    last_error = error.to_string();
                }
            }
        }
        event!(Level::ERROR, "Exhausted batch metering attempts.");
        dimensions
            .keys()
            .map(|dimension| {
                (
                    dimension.clone(),
                    DimensionOutcome::Failed {
                        message: format!("Failed to meter bill. {last_error}"),
                    },
                )
            })
            .collect()
    }

    fn reduce_batch(
        &self,
        dimensions: &UsageDimensions,
        response: BatchMeterUsageResponse,
    ) -> HashMap<String, DimensionOutcome> {
        let mut outcomes = HashMap::new();

        for result in response.results {
            let UsageRecordResult {
                record,
                metering_record_id,
                status,
            } = result;
            let outcome = match status {
                Some(RecordStatus::Success) => DimensionOutcome::Submitted {
                    record_id: metering_record_id,
                },
                Some(RecordStatus::CustomerNotSubscribed) => DimensionOutcome::Failed {
                    message: format!("Customer not subscribed to {}", self.product_code),
                },
                Some(_) | None => DimensionOutcome::Failed {
                    message: format!("Status unknown for dimension: {}", record.dimension),
                },
            };
            outcomes.insert(record.dimension, outcome);
        }

        for record in response.unprocessed {
            let message = format!(
                "Unable to process metering for dimension: {}",
                record.dimension
            );
            outcomes.insert(record.dimension, DimensionOutcome::Failed { message });
        }

        // One outcome per requested dimension, nothing more, nothing
        // less, even if the remote response dropped or invented records.
        for dimension in dimensions.keys() {
            outcomes
                .entry(dimension.clone())
                .or_insert_with(|| DimensionOutcome::Failed {
                    message: format!("Status unknown for dimension: {dimension}"),
                });
        }
        outcomes.retain(|dimension, _| dimensions.contains_key(dimension));

        outcomes
    }
}
