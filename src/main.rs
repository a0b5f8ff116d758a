use std::env;
use std::fs::File;
use std::io::{stdin, Read};
use std::path::PathBuf;
use std::process::exit;

use clap::Parser;
use log::{error, info};
use thiserror::Error;

mod cli;

use crate::cli::{Cli, Commands, Config};

use serac::archive::ArchiveWriter;
use serac::buf::fill_buf;
use serac::hash;
use serac::transport::sigv4::{Credentials, SigV4Executor};
use serac::upload::{MultipartSession, UploadError};

// Shell-owned exit codes; the library only knows the error taxonomy
const EXIT_CONNECTION: i32 = 1;
const EXIT_UPLOAD: i32 = 2;
const EXIT_FILE: i32 = 8;
const EXIT_INVALID_PARAMETER: i32 = 14;

#[derive(Error, Debug)]
enum ShellError {
    #[error("config: {0}")]
    Config(String),
    #[error(transparent)]
    File(#[from] std::io::Error),
    #[error(transparent)]
    Upload(#[from] UploadError),
}

fn exit_code(err: &ShellError) -> i32 {
    match err {
        ShellError::Config(_) => EXIT_INVALID_PARAMETER,
        ShellError::File(_) => EXIT_FILE,
        ShellError::Upload(upload) => match upload {
            UploadError::InvalidArgument(_) => EXIT_INVALID_PARAMETER,
            UploadError::Transport(_) => EXIT_CONNECTION,
            UploadError::EmptyArchive => EXIT_FILE,
            _ => EXIT_UPLOAD,
        },
    }
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    if let Err(err) = run(&cli) {
        error!("{}", err);
        exit(exit_code(&err));
    }
}

fn run(cli: &Cli) -> Result<(), ShellError> {
    let config = load_config(cli)?;
    let creds = credentials()?;
    let executor =
        SigV4Executor::new(&config.endpoint(), &config.region, creds).map_err(UploadError::from)?;

    match &cli.command {
        Commands::Upload {
            file,
            vault,
            description,
        } => upload(
            &executor,
            &config,
            file.as_ref(),
            vault.as_deref(),
            description.as_deref(),
        ),
        Commands::Abort { upload_id, vault } => {
            abort(&executor, &config, upload_id, vault.as_deref())
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config, ShellError> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("serac.toml"));
    let text = std::fs::read_to_string(&path)?;
    toml::from_str(&text).map_err(|e| ShellError::Config(format!("{}: {}", path.display(), e)))
}

fn credentials() -> Result<Credentials, ShellError> {
    let access_key = env::var("AWS_ACCESS_KEY_ID")
        .map_err(|_| ShellError::Config("AWS_ACCESS_KEY_ID is not set".to_string()))?;
    let secret_key = env::var("AWS_SECRET_ACCESS_KEY")
        .map_err(|_| ShellError::Config("AWS_SECRET_ACCESS_KEY is not set".to_string()))?;
    Ok(Credentials {
        access_key,
        secret_key,
    })
}

fn upload(
    executor: &SigV4Executor,
    config: &Config,
    file: Option<&PathBuf>,
    vault: Option<&str>,
    description: Option<&str>,
) -> Result<(), ShellError> {
    let vault = vault.unwrap_or(&config.vault);
    let description = description.map(str::to_string).or_else(|| {
        file.and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
    });

    let mut source: Box<dyn Read> = match file {
        Some(path) => Box::new(File::open(path)?),
        None => Box::new(stdin()),
    };

    let mut writer =
        ArchiveWriter::create(executor, vault, config.part_size(), description.as_deref())?;

    // Feed a leaf at a time; the part buffer handles any seam
    let mut buf = vec![0u8; hash::LEAF_SIZE];
    loop {
        match fill_buf(&mut source, &mut buf)? {
            (true, 0) => break,
            (eof, len) => {
                writer.write(&buf[..len])?;
                if eof {
                    break;
                }
            }
        }
    }

    let receipt = writer.close()?;
    info!(
        "uploaded {} bytes in {} parts",
        writer.session().uploaded_bytes(),
        writer.session().parts().len()
    );

    println!("archive-id: {}", receipt.archive_id);
    println!("location:   {}", receipt.location);
    println!("tree-hash:  {}", receipt.tree_hash);
    Ok(())
}

fn abort(
    executor: &SigV4Executor,
    config: &Config,
    upload_id: &str,
    vault: Option<&str>,
) -> Result<(), ShellError> {
    let vault = vault.unwrap_or(&config.vault);
    let mut session =
        MultipartSession::resume(executor, vault, config.part_size(), upload_id, Vec::new())?;
    session.abort()?;

    println!("aborted: {}", upload_id);
    Ok(())
}
