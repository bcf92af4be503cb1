// Copyright (C) 2024 rk8s authors
// SPDX-License-Identifier: MIT OR Apache-2.0
// Example binary exercising libfilehandle: whole-file reads and writes on
// the host filesystem, with optional io limits and a timeout.

#[macro_use]
extern crate log;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::stream;
use libfilehandle::{
    AbortSignal, Chunk, Encoding, Fs, IoLimits, OpenFlags, ReadFileOptions, SysFs, WriteData,
    WriteFileOptions,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Parser, Debug)]
#[command(author, version, about = "Read and write files through libfilehandle")]
struct Args {
    /// JSON file with io limits (camelCase keys)
    #[arg(long)]
    limits: Option<PathBuf>,
    /// Abort the operation after this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a file to stdout
    Read {
        path: PathBuf,
        /// Decode with this encoding instead of copying raw bytes
        #[arg(long)]
        encoding: Option<String>,
    },
    /// Replace a file with TEXT, or with stdin when TEXT is omitted
    Write {
        path: PathBuf,
        text: Option<String>,
        #[arg(long)]
        encoding: Option<String>,
        /// Open flags, e.g. "wx" to refuse overwriting
        #[arg(long)]
        flag: Option<String>,
    },
    /// Append TEXT, or stdin when TEXT is omitted
    Append {
        path: PathBuf,
        text: Option<String>,
        #[arg(long)]
        encoding: Option<String>,
    },
    /// Truncate or extend a file
    Truncate { path: PathBuf, len: u64 },
    /// Print size and mode of a file
    Stat { path: PathBuf },
}

/// Streams stdin; a read error fails the write instead of ending it early.
fn stdin_chunks() -> WriteData {
    let chunks = stream::try_unfold(tokio::io::stdin(), |mut stdin| async move {
        let mut buf = vec![0u8; 64 * 1024];
        let n = stdin.read(&mut buf).await?;
        let next = (n > 0).then(|| {
            buf.truncate(n);
            (Chunk::from(buf), stdin)
        });
        Ok::<_, std::io::Error>(next)
    });
    WriteData::stream(chunks)
}

fn write_options(
    encoding: Option<String>,
    flag: Option<String>,
    signal: Option<AbortSignal>,
) -> anyhow::Result<WriteFileOptions> {
    let mut options = WriteFileOptions::new();
    if let Some(encoding) = encoding {
        options = options.with_encoding(encoding.parse::<Encoding>()?);
    }
    if let Some(flag) = flag {
        options = options.with_flag(flag.parse::<OpenFlags>()?);
    }
    if let Some(signal) = signal {
        options = options.with_signal(signal);
    }
    Ok(options)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let limits = match &args.limits {
        Some(path) => IoLimits::load(path)
            .with_context(|| format!("loading limits from {}", path.display()))?,
        None => IoLimits::default(),
    };
    let fs = Fs::with_limits(SysFs::new(), limits)?;
    let signal = args
        .timeout_ms
        .map(|ms| AbortSignal::timeout(Duration::from_millis(ms)));
    debug!("limits: {:?}", fs.limits());

    match args.command {
        Command::Read { path, encoding } => {
            let mut options = ReadFileOptions::new();
            if let Some(encoding) = encoding {
                options = options.with_encoding(encoding.parse()?);
            }
            if let Some(signal) = signal {
                options = options.with_signal(signal);
            }
            let contents = fs
                .read_file(&path, &options)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&contents.into_bytes()).await?;
            stdout.flush().await?;
        }
        Command::Write {
            path,
            text,
            encoding,
            flag,
        } => {
            let options = write_options(encoding, flag, signal)?;
            let data = text.map_or_else(stdin_chunks, WriteData::from);
            fs.write_file(&path, data, &options)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
        }
        Command::Append {
            path,
            text,
            encoding,
        } => {
            let options = write_options(encoding, None, signal)?;
            let data = text.map_or_else(stdin_chunks, WriteData::from);
            fs.append_file(&path, data, &options)
                .await
                .with_context(|| format!("appending to {}", path.display()))?;
        }
        Command::Truncate { path, len } => {
            fs.truncate(&path, len)
                .await
                .with_context(|| format!("truncating {}", path.display()))?;
        }
        Command::Stat { path } => {
            let handle = fs.open(&path, OpenFlags::READ_ONLY, 0).await?;
            let stat = libfilehandle::close_after(&handle, handle.stat()).await?;
            println!(
                "{}: size {} mode {:o} uid {} gid {}",
                path.display(),
                stat.size,
                stat.mode,
                stat.uid,
                stat.gid
            );
        }
    }
    Ok(())
}
