use crate::services::thumbnail::{TargetEncoding, TransformConfig};
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, str::FromStr};

const DEFAULT_MAX_CONCURRENT: usize = 4;

/// Process configuration. Environment variables provide defaults, CLI flags
/// override them. Set once at startup and never mutated.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Bucket created at startup so uploads work out of the box.
    pub bucket: String,
    pub max_dimension: u32,
    pub jpeg_quality: u8,
    /// Thumbnails generated at the same time by the in-process dispatcher.
    pub max_concurrent: usize,
    /// Running against the local emulator: skip read integrity validation.
    pub emulator: bool,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Generates JPEG thumbnails for finalized uploads")]
pub struct Args {
    /// Host to bind to (overrides THUMBNAILER_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides THUMBNAILER_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where object payloads are stored (overrides THUMBNAILER_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides THUMBNAILER_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Default bucket (overrides THUMBNAILER_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Length of the thumbnail's longer side (overrides THUMBNAILER_MAX_DIMENSION)
    #[arg(long)]
    pub max_dimension: Option<u32>,

    /// JPEG quality, 1-100 (overrides THUMBNAILER_JPEG_QUALITY)
    #[arg(long)]
    pub jpeg_quality: Option<u8>,

    /// Concurrent thumbnail invocations (overrides THUMBNAILER_MAX_CONCURRENT)
    #[arg(long)]
    pub max_concurrent: Option<usize>,

    /// Emulator mode: disable integrity validation on reads (or THUMBNAILER_EMULATOR=1)
    #[arg(long)]
    pub emulator: bool,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        Self::merge(Args::parse(), |name| env::var(name))
    }

    fn merge(
        args: Args,
        var: impl Fn(&str) -> Result<String, env::VarError>,
    ) -> Result<(Self, bool)> {
        let lookup = |name: &str| -> Result<Option<String>> {
            match var(name) {
                Ok(value) => Ok(Some(value)),
                Err(env::VarError::NotPresent) => Ok(None),
                Err(err) => Err(err).with_context(|| format!("reading {}", name)),
            }
        };

        let env_port: Option<u16> = parse_opt("THUMBNAILER_PORT", lookup("THUMBNAILER_PORT")?)?;
        let env_max_dimension: Option<u32> =
            parse_opt("THUMBNAILER_MAX_DIMENSION", lookup("THUMBNAILER_MAX_DIMENSION")?)?;
        let env_quality: Option<u8> =
            parse_opt("THUMBNAILER_JPEG_QUALITY", lookup("THUMBNAILER_JPEG_QUALITY")?)?;
        let env_max_concurrent: Option<usize> =
            parse_opt("THUMBNAILER_MAX_CONCURRENT", lookup("THUMBNAILER_MAX_CONCURRENT")?)?;
        let env_emulator = lookup("THUMBNAILER_EMULATOR")?
            .map(|v| parse_flag("THUMBNAILER_EMULATOR", &v))
            .transpose()?
            .unwrap_or(false);

        let defaults = TransformConfig::default();
        let TargetEncoding::Jpeg {
            quality: default_quality,
        } = defaults.encoding;

        let cfg = Self {
            host: args
                .host
                .or(lookup("THUMBNAILER_HOST")?)
                .unwrap_or_else(|| "0.0.0.0".into()),
            port: args.port.or(env_port).unwrap_or(3000),
            storage_dir: args
                .storage_dir
                .or(lookup("THUMBNAILER_STORAGE_DIR")?)
                .unwrap_or_else(|| "./data/objects".into()),
            database_url: args
                .database_url
                .or(lookup("THUMBNAILER_DATABASE_URL")?)
                .unwrap_or_else(|| "sqlite://./data/meta/thumbnailer.db".into()),
            bucket: args
                .bucket
                .or(lookup("THUMBNAILER_BUCKET")?)
                .unwrap_or_else(|| "uploads".into()),
            max_dimension: args
                .max_dimension
                .or(env_max_dimension)
                .unwrap_or(defaults.max_dimension),
            jpeg_quality: args.jpeg_quality.or(env_quality).unwrap_or(default_quality),
            max_concurrent: args
                .max_concurrent
                .or(env_max_concurrent)
                .unwrap_or(DEFAULT_MAX_CONCURRENT),
            emulator: args.emulator || env_emulator,
        };
        cfg.validate()?;

        Ok((cfg, args.migrate))
    }

    fn validate(&self) -> Result<()> {
        if self.max_dimension == 0 {
            bail!("max dimension must be at least 1");
        }
        if self.max_concurrent == 0 {
            bail!("max concurrent invocations must be at least 1");
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            bail!("jpeg quality must be within 1..=100, got {}", self.jpeg_quality);
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn transform_config(&self) -> TransformConfig {
        TransformConfig {
            encoding: TargetEncoding::Jpeg {
                quality: self.jpeg_quality,
            },
            max_dimension: self.max_dimension,
            ..TransformConfig::default()
        }
    }

    /// Integrity validation stays on except against the emulator.
    pub fn validate_integrity(&self) -> bool {
        !self.emulator
    }
}

fn parse_opt<T>(name: &str, value: Option<String>) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .map(|v| {
            v.parse::<T>()
                .with_context(|| format!("parsing {} value `{}`", name, v))
        })
        .transpose()
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("parsing {} value `{}`: expected a boolean", name, other),
    }
}
