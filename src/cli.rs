use clap::{Parser, Subcommand};

use evalboard::models::metric::EvaluationType;
use evalboard::StepType;

/// Evalboard: inspect reconciled metrics of LLM evaluation runs
#[derive(Parser)]
#[command(name = "evalboard", version, about)]
pub struct Cli {
    /// Project scope; overrides EVALBOARD_PROJECT_ID
    #[arg(long, global = true)]
    pub project: Option<String>,

    /// Evaluation type of the run (auto, human, online, custom)
    #[arg(long, global = true)]
    pub evaluation_type: Option<EvaluationType>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Reconciled metrics for one or more scenarios of a run
    ScenarioMetrics {
        #[arg(long)]
        run: String,
        #[arg(long = "scenario", required = true, num_args = 1..)]
        scenarios: Vec<String>,
    },

    /// Run-level stats
    RunStats {
        #[arg(long)]
        run: String,
        /// Fold timestamped (streaming) records into the stats
        #[arg(long)]
        include_temporal: bool,
    },

    /// Resolve one table column for a scenario
    Column {
        #[arg(long)]
        run: String,
        #[arg(long)]
        scenario: String,
        #[arg(long)]
        step_type: StepType,
        #[arg(long)]
        path: Option<String>,
        #[arg(long)]
        step_key: Option<String>,
        #[arg(long)]
        metric_key: Option<String>,
        #[arg(long)]
        evaluator: Option<String>,
        #[arg(long)]
        value_key: Option<String>,
    },

    /// Fetch trace trees
    Traces {
        #[arg(long = "trace", required = true, num_args = 1..)]
        traces: Vec<String>,
    },
}
