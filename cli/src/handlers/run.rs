use std::{error::Error, time::Instant};

use flashplan::{
    ArrayElement, AttentionElement, AttentionEngine, BackwardParams, CpuMainloop,
    F8E4M3, PlanSummary,
};
use half::{bf16, f16};
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{ArrayD, IxDyn};
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::Serialize;

use super::{ElementType, HandlerResult, ProblemArgs, plan::format_summary};

#[derive(Debug, Serialize)]
struct RunReport {
    summary: PlanSummary,
    forward_seconds: f64,
    backward_seconds: Option<f64>,
    /// Mean magnitude of the attention output.
    out_mean_abs: f32,
    /// Rows whose log-sum-exp is infinite (no visible key).
    empty_rows: usize,
    dq_mean_abs: Option<f32>,
}

fn random_tensor<T: ArrayElement>(
    shape: &[usize],
    rng: &mut StdRng,
) -> ArrayD<T> {
    ArrayD::from_shape_fn(IxDyn(shape), |_| {
        T::from_f32_value(rng.random_range(-1.0..1.0))
    })
}

fn mean_abs<T: ArrayElement>(array: &ArrayD<T>) -> f32 {
    if array.is_empty() {
        return 0.0;
    }
    array.iter().map(|x| x.to_f32_value().abs()).sum::<f32>() / array.len() as f32
}

fn spinner(message: &str) -> Result<ProgressBar, Box<dyn Error>> {
    let progress_bar = ProgressBar::new_spinner();
    progress_bar.enable_steady_tick(std::time::Duration::from_millis(100));
    progress_bar.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    progress_bar.set_message(message.to_string());
    Ok(progress_bar)
}

fn run_typed<T: AttentionElement>(
    engine: &AttentionEngine<CpuMainloop>,
    problem: &ProblemArgs,
    backward: bool,
    deterministic: bool,
    seed: u64,
) -> Result<RunReport, Box<dyn Error>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let q = random_tensor::<T>(&problem.q_shape(), &mut rng);
    let k = random_tensor::<T>(&problem.k_shape(), &mut rng);
    let v = random_tensor::<T>(&problem.k_shape(), &mut rng);
    let params = problem.params();

    let progress_bar = spinner("forward")?;
    let start = Instant::now();
    let forward = engine.forward(&q.view(), &k.view(), &v.view(), &params);
    let forward_seconds = start.elapsed().as_secs_f64();
    progress_bar.finish_and_clear();
    let forward = forward?;

    let backward_result = if backward {
        let dout = random_tensor::<T>(&problem.q_shape(), &mut rng);
        // Backward consumes the output in the input element type.
        let out = forward.out.mapv(|x| T::from_f32_value(x.to_f32_value()));
        let mut backward_params = BackwardParams::from(&params);
        backward_params.deterministic = deterministic;

        let progress_bar = spinner("backward")?;
        let start = Instant::now();
        let grads = engine.backward(
            &dout.view(),
            &q.view(),
            &k.view(),
            &v.view(),
            &out.view(),
            &forward.lse.view(),
            &backward_params,
        );
        let seconds = start.elapsed().as_secs_f64();
        progress_bar.finish_and_clear();
        Some((seconds, mean_abs(&grads?.dq)))
    } else {
        None
    };

    Ok(RunReport {
        summary: forward.summary,
        forward_seconds,
        backward_seconds: backward_result.map(|(seconds, _)| seconds),
        out_mean_abs: mean_abs(&forward.out),
        empty_rows: forward.lse.iter().filter(|lse| lse.is_infinite()).count(),
        dq_mean_abs: backward_result.map(|(_, dq)| dq),
    })
}

pub fn handle_run(
    problem: &ProblemArgs,
    backward: bool,
    deterministic: bool,
    seed: u64,
    json: bool,
) -> HandlerResult {
    let engine = problem.engine()?;
    let report = match problem.dtype {
        ElementType::F16 => run_typed::<f16>(&engine, problem, backward, deterministic, seed)?,
        ElementType::Bf16 => run_typed::<bf16>(&engine, problem, backward, deterministic, seed)?,
        ElementType::F8 => run_typed::<F8E4M3>(&engine, problem, backward, deterministic, seed)?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!("{}", format_summary(&report.summary));
    println!("{:>12} {:.3}s", "forward", report.forward_seconds);
    if let Some(seconds) = report.backward_seconds {
        println!("{:>12} {:.3}s", "backward", seconds);
    }
    println!("{:>12} {:.4}", "|out|", report.out_mean_abs);
    println!("{:>12} {}", "empty_rows", report.empty_rows);
    if let Some(dq) = report.dq_mean_abs {
        println!("{:>12} {:.4}", "|dq|", dq);
    }
    Ok(())
}
