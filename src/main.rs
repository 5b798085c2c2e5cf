use std::collections::BTreeMap;

use clap::Parser;
use serde_json::{json, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use evalboard::{config, ColumnDescriptor, ColumnResolver, EvalSession};

mod cli;

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "evalboard=info".into()),
    );
    let json = std::env::var("EVALBOARD_LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    // Logs go to stderr so stdout stays valid JSON.
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let mut cfg = config::load()?;
    let args = cli::Cli::parse();
    if let Some(project) = args.project {
        cfg.project_id = Some(project);
    }
    if cfg.project_id.is_none() {
        anyhow::bail!("no project selected: pass --project or set EVALBOARD_PROJECT_ID");
    }

    let session = EvalSession::from_config(&cfg)?;
    tracing::debug!(api_url = %cfg.api_url, project_id = ?cfg.project_id, "session ready");

    let result = run(&session, args.command, args.evaluation_type).await;
    match result {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Err(e) => {
            eprintln!("Error: {:?}", e);
            Err(e)
        }
    }
}

async fn run(
    session: &EvalSession,
    command: cli::Commands,
    evaluation_type: Option<evalboard::models::metric::EvaluationType>,
) -> anyhow::Result<Value> {
    match command {
        cli::Commands::ScenarioMetrics { run, scenarios } => {
            if let Some(t) = evaluation_type {
                session.set_evaluation_type(&run, t);
            }
            let loads = scenarios
                .iter()
                .map(|sid| session.scenario_metrics(&run, sid));
            let results = futures::future::join_all(loads).await;

            let mut out = BTreeMap::new();
            for (sid, result) in scenarios.iter().zip(results) {
                out.insert(sid.clone(), serde_json::to_value(result?.as_deref())?);
            }
            Ok(json!(out))
        }
        cli::Commands::RunStats { run, include_temporal } => {
            if let Some(t) = evaluation_type {
                session.set_evaluation_type(&run, t);
            }
            let stats = session.run_level_stats(&run, include_temporal).await?;
            Ok(serde_json::to_value(stats.as_deref())?)
        }
        cli::Commands::Column {
            run,
            scenario,
            step_type,
            path,
            step_key,
            metric_key,
            evaluator,
            value_key,
        } => {
            if let Some(t) = evaluation_type {
                session.set_evaluation_type(&run, t);
            }
            let column = ColumnDescriptor {
                step_type,
                path,
                step_key,
                metric_key,
                evaluator_key: evaluator,
                value_key,
            };
            let value = ColumnResolver::new(session)
                .resolve(&run, &scenario, &column)
                .await?;
            Ok(serde_json::to_value(value)?)
        }
        cli::Commands::Traces { traces } => {
            let loads = traces.iter().map(|id| session.trace(id));
            let results = futures::future::join_all(loads).await;

            let mut out = BTreeMap::new();
            for (id, result) in traces.iter().zip(results) {
                out.insert(id.clone(), serde_json::to_value(result?)?);
            }
            Ok(json!(out))
        }
    }
}
