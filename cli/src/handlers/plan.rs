use console::Style;
use flashplan::PlanSummary;

use super::{HandlerResult, ProblemArgs};

pub(super) fn format_summary(summary: &PlanSummary) -> String {
    let key = Style::new().bold();
    let rows = [
        ("variant", summary.variant.clone()),
        ("scheduler", format!("{:?}", summary.scheduler)),
        ("tile", format!("{}x{}", summary.block_m, summary.block_n)),
        ("cluster_m", summary.cluster_m.to_string()),
        ("pack_gqa", summary.pack_gqa.to_string()),
        ("num_splits", summary.num_splits.to_string()),
        ("num_workers", summary.num_workers.to_string()),
        ("total_tiles", summary.total_tiles.to_string()),
    ];
    rows.iter()
        .map(|(name, value)| format!("{:>12} {value}", key.apply_to(name)))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn handle_plan(
    problem: &ProblemArgs,
    json: bool,
) -> HandlerResult {
    let engine = problem.engine()?;
    let summary = engine.plan_summary(
        problem.dtype.into(),
        problem.q_shape(),
        [problem.seqlen_k, problem.heads_k()],
        &problem.params(),
    )?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", format_summary(&summary));
    }
    Ok(())
}
