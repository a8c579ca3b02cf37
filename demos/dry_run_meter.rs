extern crate amazon_billing_adapter;

use amazon_billing_adapter::{meter_billing, Config, UsageDimensions};
use chrono::Utc;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Marketplace product code to meter against
    #[arg(short, long)]
    product_code: String,

    /// Dimension name to submit
    #[arg(short, long)]
    dimension: String,

    /// Usage quantity
    #[arg(short, long, default_value_t = 1)]
    quantity: u64,

    /// Customer identifier; switches submission to one batch call
    #[arg(short, long)]
    customer_identifier: Option<String>,
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt::init();

    let config = Config {
        product_code: args.product_code,
    };
    let mut dimensions = UsageDimensions::new();
    dimensions.insert(args.dimension, args.quantity);

    match meter_billing(
        &config,
        &dimensions,
        Utc::now(),
        true,
        args.customer_identifier.as_deref(),
    ) {
        Ok(outcomes) => {
            for (dimension, outcome) in outcomes {
                println!("{dimension}: {outcome:?}");
            }
        }
        Err(error) => eprintln!("dry-run submission failed: {error}"),
    }
}
