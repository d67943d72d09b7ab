use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use streamrate::{
    BitRate, ByteSink, ByteSource, IoSink, IoSource, MeterReader, Reader, StreamRateConfig,
    StreamRateError, Total,
};

type Input = IoSource<Box<dyn AsyncRead + Unpin + Send>>;
type Output = IoSink<Box<dyn AsyncWrite + Unpin + Send>>;

/// Copy a byte stream at a limited bit rate and report the rate achieved.
#[derive(Parser, Debug)]
#[command(name = "streamrate", version, about)]
struct Args {
    /// Limiting bit rate such as `64kbit/s` or `2MB/s`; unlimited when absent
    #[arg(short, long)]
    rate: Option<BitRate>,

    /// Read from this file instead of stdin
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Write to this file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// How often to log the current bit rate
    #[arg(long)]
    report_interval_ms: Option<u64>,

    /// Size of each read
    #[arg(long, default_value_t = 32 * 1024)]
    buffer_size: usize,

    /// Log as JSON
    #[arg(long)]
    json: bool,
}

/// A source that reports what it measured.
trait Metered: ByteSource {
    fn bit_rate(&self) -> BitRate;
    fn total(&self) -> Total;
}

impl<S: ByteSource> Metered for Reader<S> {
    fn bit_rate(&self) -> BitRate {
        Reader::bit_rate(self)
    }

    fn total(&self) -> Total {
        Reader::total(self)
    }
}

impl<S: ByteSource> Metered for MeterReader<S> {
    fn bit_rate(&self) -> BitRate {
        MeterReader::bit_rate(self)
    }

    fn total(&self) -> Total {
        MeterReader::total(self)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout may carry the data.
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if args.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let mut config = StreamRateConfig::load(args.config.as_deref())?;
    if let Some(rate) = args.rate {
        config.rate = Some(rate);
    }
    if let Some(interval) = args.report_interval_ms {
        config.report_interval_ms = interval;
    }
    config.validate()?;
    if args.buffer_size == 0 {
        anyhow::bail!("buffer size must be positive");
    }

    match config.rate {
        Some(rate) => info!(rate = %rate, "Limiting transfer"),
        None => info!("Measuring transfer without a limit"),
    }

    let reader: Box<dyn AsyncRead + Unpin + Send> = match &args.input {
        Some(path) => Box::new(tokio::fs::File::open(path).await?),
        None => Box::new(tokio::io::stdin()),
    };
    let writer: Box<dyn AsyncWrite + Unpin + Send> = match &args.output {
        Some(path) => Box::new(tokio::fs::File::create(path).await?),
        None => Box::new(tokio::io::stdout()),
    };
    let input: Input = IoSource::new(reader);
    let output: Output = IoSink::new(writer);

    let source: Arc<dyn Metered> = match config.rate {
        Some(rate) => Arc::new(Reader::with_config(
            input,
            rate,
            &config.limiter,
            &config.meter,
        )?),
        None => Arc::new(MeterReader::with_config(input, &config.meter)?),
    };

    let reporter = {
        let source = Arc::clone(&source);
        let interval = Duration::from_millis(config.report_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                info!(bit_rate = %source.bit_rate(), "Transfer rate");
            }
        })
    };

    let result = tokio::select! {
        result = copy(source.as_ref(), &output, args.buffer_size) => result,
        _ = shutdown_signal() => Err(StreamRateError::Closed),
    };
    reporter.abort();
    source.close().await?;

    let total = source.total();
    info!(
        bytes = %total.bytes,
        elapsed_ms = total.elapsed.as_millis() as u64,
        rate = %total.rate,
        "Transfer finished"
    );

    match result {
        Ok(()) => {
            output.close().await?;
            Ok(())
        }
        Err(StreamRateError::Closed) => {
            info!("Transfer interrupted");
            output.flush().await?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Copy `source` to `sink` until end of stream.
async fn copy(source: &dyn Metered, sink: &Output, buffer_size: usize) -> streamrate::Result<()> {
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let mut written = 0;
        while written < n {
            let m = sink.write(&buf[written..n]).await?;
            if m == 0 {
                return Err(StreamRateError::ZeroWrite);
            }
            written += m;
        }
    }
    sink.flush().await
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, closing stream");
        }
        _ = terminate => {
            info!("Received SIGTERM, closing stream");
        }
    }
}
