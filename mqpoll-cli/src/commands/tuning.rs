//! Tuning command

use anyhow::Result;
use mqpoll_core::dto::tuning::TuningParameters;

use crate::config::TuningArgs;

/// Prints the tuning the scheduler would run with
pub fn show(args: &TuningArgs) -> Result<()> {
    let params = TuningParameters::from(args.resolve()?);
    println!("{}", serde_json::to_string_pretty(&params)?);
    Ok(())
}
