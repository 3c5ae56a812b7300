use crate::duplicate::DuplicateAction;
use crate::reconcile::DeletedAction;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub use crate::inventory::DEFAULT_TOP_N;
pub use crate::retry::DEFAULT_MAX_ATTEMPTS;

pub const DEFAULT_THRESHOLD_MB: u64 = 5 * 1024;
pub const DEFAULT_SEGMENT_SIZE_MB: u64 = 2 * 1024;
pub const MIN_SEGMENT_SIZE_MB: u64 = 5; // S3 minimum part size
pub const MAX_SEGMENT_SIZE_MB: u64 = 5 * 1024; // 5GB maximum in MB
pub const DEFAULT_MEMORY_BUFFER_MB: u64 = 64;
pub const MAX_CONCURRENCY: usize = 256;
pub const MAX_ATTEMPTS_LIMIT: u32 = 20;
pub const DEFAULT_REGION: &str = "us-east-1";
pub const STAGING_DIR_ENV: &str = "STORE_MIGRATE_STAGING_DIR";

/// CLI arguments for the tenant object-store migration tool
#[derive(Parser, Debug)]
#[command(name = "store_migrate")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Summarise tenant, container and object usage at the source
    Stat {
        #[command(flatten)]
        source: SourceArgs,

        /// Number of tenants listed in the usage ranking
        #[arg(long, default_value_t = DEFAULT_TOP_N)]
        top_n: usize,
    },

    /// Copy new and changed objects from source to destination
    Copy {
        #[command(flatten)]
        source: SourceArgs,

        #[command(flatten)]
        destination: DestinationArgs,

        #[command(flatten)]
        transfer: TransferArgs,
    },

    /// Find container names present in more than one source region
    CheckDuplicate {
        /// Source region as NAME=ENDPOINT, repeatable; the first listed keeps duplicate names
        #[arg(long = "region", value_name = "NAME=ENDPOINT", required = true)]
        regions: Vec<String>,

        /// Rename suffix for a region as NAME=SUFFIX (default: the region name)
        #[arg(long = "suffix", value_name = "NAME=SUFFIX")]
        suffixes: Vec<String>,

        /// Profile used for every source region
        #[arg(long)]
        source_profile: Option<String>,

        /// Report duplicates only, or rename them away in all but the first region
        #[arg(long, value_enum, default_value_t = DuplicateAction::Report)]
        action: DuplicateAction,
    },

    /// Find destination data no longer present in any source region
    CheckDeleted {
        /// Source region as NAME=ENDPOINT, repeatable
        #[arg(long = "region", value_name = "NAME=ENDPOINT", required = true)]
        regions: Vec<String>,

        /// Profile used for every source region
        #[arg(long)]
        source_profile: Option<String>,

        #[command(flatten)]
        destination: DestinationArgs,

        /// Report orphans only, or delete them from the destination
        #[arg(long, value_enum, default_value_t = DeletedAction::Report)]
        action: DeletedAction,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct SourceArgs {
    /// Source store endpoint URL (uses AWS S3 if not specified)
    #[arg(long)]
    pub source_endpoint: Option<String>,

    /// Source region name, stamped on migrated containers and used for request signing
    #[arg(long, default_value = DEFAULT_REGION)]
    pub source_region: String,

    /// Credentials profile for the source store
    #[arg(long)]
    pub source_profile: Option<String>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct DestinationArgs {
    /// Destination store endpoint URL (uses AWS S3 if not specified)
    #[arg(long)]
    pub dest_endpoint: Option<String>,

    /// Destination region used for request signing and bucket placement
    #[arg(long, default_value = DEFAULT_REGION)]
    pub dest_region: String,

    /// Credentials profile for the destination store
    #[arg(long)]
    pub dest_profile: Option<String>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct TransferArgs {
    /// Objects at or above this size in MB are segmented (default: 5120)
    #[arg(long, default_value_t = DEFAULT_THRESHOLD_MB)]
    pub threshold_mb: u64,

    /// Segment size in MB (default: 2048, min: 5, max: 5120)
    #[arg(long, default_value_t = DEFAULT_SEGMENT_SIZE_MB)]
    pub segment_size_mb: u64,

    /// Small objects up to this size in MB are buffered in memory instead of staged (default: 64)
    #[arg(long, default_value_t = DEFAULT_MEMORY_BUFFER_MB)]
    pub memory_buffer_mb: u64,

    /// Directory for staged objects (falls back to $STORE_MIGRATE_STAGING_DIR, then the system temp dir)
    #[arg(long)]
    pub staging_dir: Option<PathBuf>,

    /// Most MB a worker may stage at once; exceeding it stops the worker as a full disk would
    #[arg(long)]
    pub staging_quota_mb: Option<u64>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct CommonArgs {
    /// Number of concurrent workers (default: available CPU parallelism)
    #[arg(short, long, global = true)]
    pub concurrency: Option<usize>,

    /// Only process these tenants (comma separated or repeated)
    #[arg(long = "tenant", value_delimiter = ',', global = true)]
    pub tenants: Vec<String>,

    /// Skip these tenants (comma separated or repeated)
    #[arg(long = "exclude-tenant", value_delimiter = ',', global = true)]
    pub exclude_tenants: Vec<String>,

    /// File listing tenants to process, one per line
    #[arg(long, global = true)]
    pub tenants_file: Option<PathBuf>,

    /// File listing tenants to skip, one per line
    #[arg(long, global = true)]
    pub exclude_tenants_file: Option<PathBuf>,

    /// Only process these containers
    #[arg(long = "container", value_delimiter = ',', global = true)]
    pub containers: Vec<String>,

    /// Skip these containers
    #[arg(long = "exclude-container", value_delimiter = ',', global = true)]
    pub exclude_containers: Vec<String>,

    /// Only process these objects
    #[arg(long = "object", global = true)]
    pub objects: Vec<String>,

    /// Skip these objects
    #[arg(long = "exclude-object", global = true)]
    pub exclude_objects: Vec<String>,

    /// Record per-object detail during scans
    #[arg(short, long, default_value_t = false, global = true)]
    pub verbose: bool,

    /// Suppress informational output and progress bars
    #[arg(short, long, default_value_t = false, global = true)]
    pub quiet: bool,

    /// Write the final report as JSON to this path
    #[arg(long, global = true)]
    pub json_report: Option<PathBuf>,

    /// Attempts per store request before giving up (default: 5, max: 20)
    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS, global = true)]
    pub max_attempts: u32,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "warn", global = true)]
    pub log_level: String,

    /// Character separating tenant and container in bucket names
    #[arg(long, default_value_t = crate::store::s3::DEFAULT_TENANT_DELIMITER, global = true)]
    pub tenant_delimiter: char,

    /// Tenant owning buckets whose name has no tenant prefix
    #[arg(long, default_value = "default", global = true)]
    pub default_tenant: String,

    /// Use virtual-hosted style addressing instead of path style
    #[arg(long, default_value_t = false, global = true)]
    pub virtual_hosted: bool,
}
