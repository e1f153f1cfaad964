//! Offline route planner
//!
//! Computes the route to a spot against a layout file and prints it as JSON.
//!
//! Usage:
//!   plan-route --layout config/layout.toml --spot 101 --row 0 --col 0

use anyhow::Context;
use clap::Parser;
use cloudpark::domain::{Layout, SpotId};
use cloudpark::services::navigation::plan_route;
use serde_json::json;

#[derive(Parser, Debug)]
#[command(name = "plan-route", version, about = "Plan a route to a parking spot")]
struct Args {
    /// Layout TOML file
    #[arg(short, long, default_value = "config/layout.toml")]
    layout: String,

    /// Target spot id
    #[arg(short, long)]
    spot: i64,

    /// Start row
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    row: i64,

    /// Start column
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    col: i64,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let layout = Layout::from_file(&args.layout)?;

    let output = match plan_route(&layout, SpotId(args.spot), args.row, args.col)
        .with_context(|| format!("Cannot route to spot {}", args.spot))?
    {
        Some(route) => json!({ "path": route.path, "instructions": route.instructions }),
        None => json!({ "error": "no path" }),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
