mod capture;
mod cli;
mod clock;
mod conf;
mod engine;
mod error;
mod flow;
mod metrics;
mod output;
mod packet;
mod reaper;
mod tsval;

use std::{
    process,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use clap::Parser as _;
use tokio::{signal, sync::broadcast};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::{
    capture::{PacketSource, ReadOutcome},
    cli::Cli,
    conf::{Conf, Source},
    engine::Engine,
    error::Result,
    output::SampleSink,
    reaper::Reaper,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let argument_error = e.use_stderr();
            let _ = e.print();
            process::exit(if argument_error { 1 } else { 0 });
        }
    };
    let conf = Conf::resolve(cli)?;

    metrics::init(
        conf.listen,
        Duration::from_secs_f64(conf.engine.flow_max_idle),
    )?;

    let source = match &conf.source {
        Source::Live(ifname) => PacketSource::open_live(ifname, &conf.bpf_filter).map_err(|e| {
            error!(interface = %ifname, error.message = %e, "couldn't open capture source");
            e
        }),
        Source::File(path) => PacketSource::open_file(path, &conf.bpf_filter).map_err(|e| {
            error!(path = %path.display(), error.message = %e, "couldn't open capture source");
            e
        }),
    }?;
    info!(
        filter = %conf.bpf_filter,
        flush_interval_us = conf.flush_interval.as_micros() as u64,
        "capture source open"
    );

    let sink = SampleSink::stdout(conf.machine_readable);
    let engine = Arc::new(Mutex::new(Engine::new(
        conf.engine.clone(),
        sink.clone(),
        Box::new(std::io::stderr()),
    )));

    let (shutdown_tx, _) = broadcast::channel(1);
    let flush_task = tokio::spawn(output::run_flush_loop(
        sink.clone(),
        conf.flush_interval,
        shutdown_tx.subscribe(),
    ));
    let reaper_task = tokio::spawn(
        Reaper::new(engine.clone(), conf.engine.tsval_max_age).run(shutdown_tx.subscribe()),
    );

    let terminated = Arc::new(AtomicBool::new(false));
    spawn_signal_watcher(terminated.clone())?;

    let loop_engine = engine.clone();
    let loop_terminated = terminated.clone();
    tokio::task::spawn_blocking(move || packet_loop(source, loop_engine, loop_terminated)).await?;

    // Retire all remaining state, then stop the background tasks.
    engine.lock().unwrap().final_sweep();
    let _ = shutdown_tx.send(());
    let _ = tokio::join!(flush_task, reaper_task);
    sink.flush();

    Ok(())
}

fn spawn_signal_watcher(terminated: Arc<AtomicBool>) -> Result<()> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        info!("termination signal received, stopping capture");
        terminated.store(true, Ordering::Relaxed);
    });
    Ok(())
}

/// Synchronous capture loop. All engine mutations happen here or in
/// the reaper, serialized by the engine mutex.
fn packet_loop(mut source: PacketSource, engine: Arc<Mutex<Engine>>, terminated: Arc<AtomicBool>) {
    loop {
        if terminated.load(Ordering::Relaxed) {
            break;
        }
        match source.read_next() {
            Ok(ReadOutcome::Frame(frame)) => {
                let mut engine = engine.lock().unwrap();
                engine.process_frame(&frame);
                if engine.limit_reached() {
                    engine.report_limit_stop();
                    break;
                }
                engine.maybe_summarize();
            }
            Ok(ReadOutcome::Idle) => continue,
            Ok(ReadOutcome::Done) => break,
            Err(e) => {
                error!(error.message = %e, "capture read failed, shutting down");
                break;
            }
        }
    }
}
