//! Validated run configuration built from the command line and environment.

use crate::args::{
    CommonArgs, MAX_ATTEMPTS_LIMIT, MAX_CONCURRENCY, MAX_SEGMENT_SIZE_MB, MIN_SEGMENT_SIZE_MB,
    STAGING_DIR_ENV, TransferArgs,
};
use crate::copier::CopySettings;
use crate::filter::{NameFilter, ScanFilter, read_name_list};
use crate::retry::RetryPolicy;
use crate::store::s3::{DEFAULT_COPY_CONCURRENCY, S3StoreConfig};
use anyhow::{Context, Result, anyhow};
use std::collections::BTreeSet;
use std::env;
use std::path::PathBuf;

const MIB: u64 = 1024 * 1024;

/// Settings shared by every subcommand.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub concurrency: usize,
    pub filter: ScanFilter,
    pub verbose: bool,
    pub quiet: bool,
    pub json_report: Option<PathBuf>,
    pub max_attempts: u32,
    tenant_delimiter: char,
    default_tenant: String,
    path_style: bool,
}

impl MigrationConfig {
    pub fn from_args(args: &CommonArgs) -> Result<Self> {
        let concurrency = match args.concurrency {
            Some(n) => n,
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        };
        if concurrency == 0 || concurrency > MAX_CONCURRENCY {
            return Err(anyhow!(
                "Concurrency must be between 1 and {}",
                MAX_CONCURRENCY
            ));
        }
        if args.max_attempts == 0 || args.max_attempts > MAX_ATTEMPTS_LIMIT {
            return Err(anyhow!(
                "Max attempts must be between 1 and {}",
                MAX_ATTEMPTS_LIMIT
            ));
        }
        if args.default_tenant.contains(args.tenant_delimiter) {
            return Err(anyhow!(
                "Default tenant `{}` cannot contain the tenant delimiter `{}`",
                args.default_tenant,
                args.tenant_delimiter
            ));
        }

        let mut include = args.tenants.clone();
        if let Some(path) = &args.tenants_file {
            include.extend(read_name_list(path)?);
        }
        let mut exclude = args.exclude_tenants.clone();
        if let Some(path) = &args.exclude_tenants_file {
            exclude.extend(read_name_list(path)?);
        }

        let filter = ScanFilter {
            tenants: NameFilter::new(include, exclude),
            containers: NameFilter::new(
                args.containers.iter().cloned(),
                args.exclude_containers.iter().cloned(),
            ),
            objects: NameFilter::new(
                args.objects.iter().cloned(),
                args.exclude_objects.iter().cloned(),
            ),
        };

        Ok(Self {
            concurrency,
            filter,
            verbose: args.verbose,
            quiet: args.quiet,
            json_report: args.json_report.clone(),
            max_attempts: args.max_attempts,
            tenant_delimiter: args.tenant_delimiter,
            default_tenant: args.default_tenant.clone(),
            path_style: !args.virtual_hosted,
        })
    }

    /// Client settings for one store endpoint.
    pub fn store(
        &self,
        endpoint: Option<&str>,
        region: &str,
        profile: Option<&str>,
    ) -> S3StoreConfig {
        S3StoreConfig {
            region: Some(region.to_string()),
            endpoint: endpoint.map(str::to_string),
            profile: profile.map(str::to_string),
            path_style: self.path_style,
            max_attempts: self.max_attempts,
            // Every worker may run a full set of part copies at once
            pool_size: self.concurrency * DEFAULT_COPY_CONCURRENCY,
            tenant_delimiter: self.tenant_delimiter,
            default_tenant: self.default_tenant.clone(),
            ..S3StoreConfig::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default().with_max_attempts(self.max_attempts)
    }
}

/// Copy tuning for the `copy` subcommand.
pub fn copy_settings(
    transfer: &TransferArgs,
    region: &str,
    retry: RetryPolicy,
) -> Result<CopySettings> {
    if transfer.segment_size_mb < MIN_SEGMENT_SIZE_MB {
        return Err(anyhow!(
            "Segment size must be at least {} MB",
            MIN_SEGMENT_SIZE_MB
        ));
    }
    if transfer.segment_size_mb > MAX_SEGMENT_SIZE_MB {
        return Err(anyhow!(
            "Segment size cannot exceed {} MB (5GB)",
            MAX_SEGMENT_SIZE_MB
        ));
    }
    if transfer.threshold_mb > MAX_SEGMENT_SIZE_MB {
        return Err(anyhow!(
            "Large object threshold cannot exceed {} MB (5GB), the largest single upload",
            MAX_SEGMENT_SIZE_MB
        ));
    }
    if transfer.threshold_mb < transfer.segment_size_mb {
        return Err(anyhow!(
            "Large object threshold ({} MB) must not be below the segment size ({} MB)",
            transfer.threshold_mb,
            transfer.segment_size_mb
        ));
    }
    if transfer.memory_buffer_mb > transfer.threshold_mb {
        return Err(anyhow!(
            "Memory buffer limit ({} MB) cannot exceed the large object threshold ({} MB)",
            transfer.memory_buffer_mb,
            transfer.threshold_mb
        ));
    }
    if region.is_empty() {
        return Err(anyhow!("Source region name cannot be empty"));
    }

    Ok(CopySettings {
        large_object_threshold: transfer.threshold_mb * MIB,
        segment_size: transfer.segment_size_mb * MIB,
        memory_buffer_limit: transfer.memory_buffer_mb * MIB,
        retry,
        region: region.to_string(),
    })
}

/// Per-worker staging quota in bytes. A quota below the large object
/// threshold could never stage a large object, so it is refused.
pub fn staging_quota(transfer: &TransferArgs) -> Result<Option<u64>> {
    match transfer.staging_quota_mb {
        Some(mb) if mb < transfer.threshold_mb => Err(anyhow!(
            "Staging quota ({} MB) must not be below the large object threshold ({} MB)",
            mb,
            transfer.threshold_mb
        )),
        Some(mb) => Ok(Some(mb * MIB)),
        None => Ok(None),
    }
}

/// Staging directory from the command line, else the environment, else the
/// system temp dir. The directory is created if missing.
pub fn staging_dir(cli: Option<PathBuf>) -> Result<PathBuf> {
    let env_dir = match env::var(STAGING_DIR_ENV) {
        Ok(value) if !value.trim().is_empty() => Some(PathBuf::from(value)),
        Ok(_) | Err(env::VarError::NotPresent) => None,
        Err(err) => return Err(err).with_context(|| format!("reading {}", STAGING_DIR_ENV)),
    };
    let dir = pick_staging_dir(cli, env_dir);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create staging directory {}", dir.display()))?;
    Ok(dir)
}

fn pick_staging_dir(cli: Option<PathBuf>, env_dir: Option<PathBuf>) -> PathBuf {
    cli.or(env_dir)
        .unwrap_or_else(|| env::temp_dir().join("store_migrate"))
}

/// One source region as given on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionSpec {
    pub name: String,
    pub endpoint: String,
    pub suffix: String,
}

/// Parses `NAME=ENDPOINT` regions and optional `NAME=SUFFIX` overrides,
/// keeping command-line order.
pub fn region_specs(regions: &[String], suffixes: &[String]) -> Result<Vec<RegionSpec>> {
    let mut specs = Vec::with_capacity(regions.len());
    let mut seen = BTreeSet::new();
    for value in regions {
        let (name, endpoint) = split_pair(value, "region")?;
        if !seen.insert(name.clone()) {
            return Err(anyhow!("Region `{}` given more than once", name));
        }
        specs.push(RegionSpec {
            suffix: name.clone(),
            name,
            endpoint,
        });
    }

    for value in suffixes {
        let (name, suffix) = split_pair(value, "suffix")?;
        let spec = specs
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| anyhow!("Suffix given for unknown region `{}`", name))?;
        spec.suffix = suffix;
    }
    Ok(specs)
}

fn split_pair(value: &str, what: &str) -> Result<(String, String)> {
    match value.split_once('=') {
        Some((name, rest)) if !name.trim().is_empty() && !rest.trim().is_empty() => {
            Ok((name.trim().to_string(), rest.trim().to_string()))
        }
        _ => Err(anyhow!("Invalid {} `{}`, expected NAME=VALUE", what, value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::{Args, Command};
    use clap::Parser;
    use std::io::Write;

    fn transfer(threshold_mb: u64, segment_size_mb: u64) -> TransferArgs {
        TransferArgs {
            threshold_mb,
            segment_size_mb,
            memory_buffer_mb: 1,
            staging_dir: None,
            staging_quota_mb: None,
        }
    }

    /// Sizes given in MB are converted to bytes.
    #[test]
    fn copy_settings_in_bytes() {
        let settings = copy_settings(&transfer(100, 10), "nz-por-1", RetryPolicy::default()).unwrap();
        assert_eq!(settings.large_object_threshold, 100 * MIB);
        assert_eq!(settings.segment_size, 10 * MIB);
        assert_eq!(settings.memory_buffer_limit, MIB);
        assert_eq!(settings.region, "nz-por-1");
    }

    /// Segment sizes outside the multipart limits are refused.
    #[test]
    fn segment_size_bounds() {
        assert!(copy_settings(&transfer(100, 4), "r", RetryPolicy::default()).is_err());
        assert!(copy_settings(&transfer(10_000, 6_000), "r", RetryPolicy::default()).is_err());
        assert!(copy_settings(&transfer(10, 20), "r", RetryPolicy::default()).is_err());
    }

    /// Objects below the threshold go up in one request, so the threshold
    /// is capped at the single-upload limit.
    #[test]
    fn threshold_fits_single_upload() {
        assert!(copy_settings(&transfer(MAX_SEGMENT_SIZE_MB, 2048), "r", RetryPolicy::default()).is_ok());
        let err = copy_settings(&transfer(MAX_SEGMENT_SIZE_MB + 1, 2048), "r", RetryPolicy::default())
            .unwrap_err();
        assert!(err.to_string().contains("threshold"), "{}", err);
    }

    /// The staging quota is optional, in bytes, and at least the threshold.
    #[test]
    fn staging_quota_bounds() {
        let mut args = transfer(100, 10);
        assert_eq!(staging_quota(&args).unwrap(), None);
        args.staging_quota_mb = Some(200);
        assert_eq!(staging_quota(&args).unwrap(), Some(200 * MIB));
        args.staging_quota_mb = Some(50);
        assert!(staging_quota(&args).is_err());
    }

    /// The command line wins over the environment for the staging dir.
    #[test]
    fn staging_dir_precedence() {
        let cli = Some(PathBuf::from("/cli"));
        let env_dir = Some(PathBuf::from("/env"));
        assert_eq!(pick_staging_dir(cli, env_dir.clone()), PathBuf::from("/cli"));
        assert_eq!(pick_staging_dir(None, env_dir), PathBuf::from("/env"));
        assert!(pick_staging_dir(None, None).ends_with("store_migrate"));
    }

    /// Regions keep their order; suffix overrides apply by name.
    #[test]
    fn parses_regions_and_suffixes() {
        let specs = region_specs(
            &["nz-por-1=http://por".to_string(), "nz-wlg-2=http://wlg".to_string()],
            &["nz-wlg-2=wlg".to_string()],
        )
        .unwrap();
        assert_eq!(specs[0].name, "nz-por-1");
        assert_eq!(specs[0].suffix, "nz-por-1");
        assert_eq!(specs[1].endpoint, "http://wlg");
        assert_eq!(specs[1].suffix, "wlg");

        assert!(region_specs(&["nope".to_string()], &[]).is_err());
        assert!(region_specs(&["a=x".to_string(), "a=y".to_string()], &[]).is_err());
        assert!(region_specs(&["a=x".to_string()], &["b=s".to_string()]).is_err());
    }

    /// Tenant include files merge with names given on the command line.
    #[test]
    fn tenant_files_extend_filters() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# migrated first\nacme\n\nglobex").unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let args = Args::parse_from([
            "store_migrate",
            "stat",
            "--tenant",
            "initech",
            "--tenants-file",
            path.as_str(),
            "-c",
            "3",
        ]);
        assert!(matches!(args.command, Command::Stat { .. }));

        let config = MigrationConfig::from_args(&args.common).unwrap();
        assert_eq!(config.concurrency, 3);
        assert!(config.filter.tenants.allows("acme"));
        assert!(config.filter.tenants.allows("globex"));
        assert!(config.filter.tenants.allows("initech"));
        assert!(!config.filter.tenants.allows("umbrella"));
    }

    /// Zero workers is not a valid configuration.
    #[test]
    fn rejects_zero_concurrency() {
        let args = Args::parse_from(["store_migrate", "stat", "--concurrency", "0"]);
        assert!(MigrationConfig::from_args(&args.common).is_err());
    }
}
