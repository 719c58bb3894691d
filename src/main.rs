use std::env;

use anyhow::{Context, Result};
use clap::Parser;

use facestream::{
    config::{Cli, Command, Isolation},
    pipeline::{
        ProducerExit, ProducerProcess, run_child_producer, sample_channel, spawn_producer_thread,
    },
    server::{ServerExit, StreamingServer},
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Some(Command::Produce) => produce(&cli),
        Some(Command::Serve) | None => serve(cli),
    }
}

fn produce(cli: &Cli) -> Result<()> {
    let capture = cli.producer.capture_backend()?;
    let engine = cli.producer.engine_backend()?;

    let summary = run_child_producer(&capture, &engine);
    log::info!(
        "producer exiting ({:?}) after {} frames, {} samples",
        summary.exit,
        summary.frames,
        summary.published
    );
    match summary.exit {
        ProducerExit::Fatal(err) => Err(err.into()),
        ProducerExit::EngineUnavailable(reason) => Err(anyhow::anyhow!(reason)),
        ProducerExit::Stopped | ProducerExit::ChannelClosed => Ok(()),
    }
}

fn serve(cli: Cli) -> Result<()> {
    let interval = cli.server.delivery_interval()?;
    let capture = cli.producer.capture_backend()?;
    let engine = cli.producer.engine_backend()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("facestream-io")
        .build()
        .context("failed to build tokio runtime")?;

    // Listen before the producer starts so the first client finds us ready.
    let server = runtime.block_on(StreamingServer::bind(
        &cli.server.host,
        cli.server.port,
        interval,
    ))?;
    let addr = server.local_addr()?;

    let handle = server.handle();
    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("shutdown requested");
            handle.shutdown();
        }
    });

    log::info!(
        "Serving at ws://{addr} ({} Hz, producer in {:?} mode)",
        cli.server.frequency,
        cli.server.isolation
    );

    // The producer is stopped outside the runtime: stopping blocks on a join
    // or on reaping the child.
    let (sender, receiver) = sample_channel();
    match cli.server.isolation {
        Isolation::Process => {
            let program = env::current_exe().context("failed to locate own executable")?;
            let producer =
                ProducerProcess::spawn(&program, &cli.producer.to_child_args(), sender)?;
            log_exit(runtime.block_on(server.run(receiver)));

            let (status, forwarded) = producer.stop();
            match status {
                Some(status) => {
                    log::info!("producer process exited ({status}), {forwarded} samples")
                }
                None => log::warn!("producer process was not reaped, {forwarded} samples"),
            }
        }
        Isolation::Thread => {
            let producer = spawn_producer_thread(capture, engine, sender)?;
            log_exit(runtime.block_on(server.run(receiver)));

            if let Some(summary) = producer.stop() {
                log::info!(
                    "producer thread exited ({:?}) after {} frames, {} samples",
                    summary.exit,
                    summary.frames,
                    summary.published
                );
            }
        }
    }
    Ok(())
}

fn log_exit(exit: ServerExit) {
    match exit {
        ServerExit::Shutdown => log::info!("server stopped"),
        ServerExit::ProducerGone(err) => log::warn!("streaming ended: {err}"),
    }
}
