use chrono::Duration as ChronoDuration;
use clap::Parser;
use std::time::Duration;
use theatre_core::timeline::{
    DEFAULT_CRITICAL_WINDOW_MINUTES, DEFAULT_DEDUP_COOLDOWN_MINUTES, DEFAULT_LOOKAHEAD_HOURS,
};
use theatre_core::TimelineWindows;

const DEFAULT_ADDR: &str = "127.0.0.1:8430";
const DEFAULT_DB: &str = ".theatre/notifications.db";
const DEFAULT_OPS_DB: &str = ".theatre/operational.db";
const DEFAULT_LOG_DIR: &str = ".theatre/logs";
const DEFAULT_APPROVER_ROLES: &str = "admin,theatre_manager,charge_nurse";

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub addr: String,
    pub db_path: String,
    pub ops_db_path: String,
    pub log_dir: String,
    pub debug: bool,
    pub heartbeat: Duration,
    pub poll_interval: Duration,
    pub aggregation_interval: Duration,
    pub windows: TimelineWindows,
    pub approver_roles: Vec<String>,
    pub channel_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            db_path: DEFAULT_DB.to_string(),
            ops_db_path: DEFAULT_OPS_DB.to_string(),
            log_dir: DEFAULT_LOG_DIR.to_string(),
            debug: false,
            heartbeat: Duration::from_secs(30),
            poll_interval: Duration::from_millis(2_000),
            aggregation_interval: Duration::from_secs(60),
            windows: TimelineWindows::default(),
            approver_roles: parse_roles(DEFAULT_APPROVER_ROLES),
            channel_capacity: 64,
        }
    }
}

impl HubConfig {
    pub fn is_approver(&self, role: &str) -> bool {
        self.approver_roles
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(role))
    }
}

#[derive(Parser, Debug)]
#[command(name = "theatre-hub")]
pub struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    db: String,
    #[arg(long, default_value = "")]
    ops_db: String,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,
    #[arg(long, default_value_t = 2_000)]
    poll_ms: u64,
    #[arg(long, default_value_t = 60)]
    aggregation_secs: u64,
    #[arg(long, default_value_t = DEFAULT_LOOKAHEAD_HOURS)]
    lookahead_hours: i64,
    #[arg(long, default_value_t = DEFAULT_CRITICAL_WINDOW_MINUTES)]
    critical_window_minutes: i64,
    #[arg(long, default_value_t = DEFAULT_DEDUP_COOLDOWN_MINUTES)]
    dedup_cooldown_minutes: i64,
    #[arg(long, default_value = "")]
    approver_roles: String,
    #[arg(long, default_value_t = 64)]
    channel_capacity: usize,
}

pub fn load_config() -> HubConfig {
    config_from_args(Args::parse())
}

pub fn config_from_args(args: Args) -> HubConfig {
    let debug = args.debug || env_true("THEATRE_HUB_DEBUG");
    let approver_roles = resolve_flag(
        &args.approver_roles,
        "THEATRE_APPROVER_ROLES",
        DEFAULT_APPROVER_ROLES,
    );
    HubConfig {
        addr: resolve_flag(&args.addr, "THEATRE_HUB_ADDR", DEFAULT_ADDR),
        db_path: resolve_flag(&args.db, "THEATRE_DB", DEFAULT_DB),
        ops_db_path: resolve_flag(&args.ops_db, "THEATRE_OPS_DB", DEFAULT_OPS_DB),
        log_dir: resolve_flag(&args.log_dir, "THEATRE_LOG_DIR", DEFAULT_LOG_DIR),
        debug,
        heartbeat: Duration::from_secs(args.heartbeat_secs.max(1)),
        poll_interval: Duration::from_millis(args.poll_ms.max(50)),
        aggregation_interval: Duration::from_secs(args.aggregation_secs.max(1)),
        windows: TimelineWindows {
            lookahead: ChronoDuration::hours(args.lookahead_hours.max(1)),
            critical_window: ChronoDuration::minutes(args.critical_window_minutes.max(1)),
            dedup_cooldown: ChronoDuration::minutes(args.dedup_cooldown_minutes.max(0)),
        },
        approver_roles: parse_roles(&approver_roles),
        channel_capacity: args.channel_capacity.max(1),
    }
}

pub fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn resolve_flag(flag: &str, env_key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    default.to_string()
}

fn parse_roles(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|role| !role.is_empty())
        .map(str::to_string)
        .collect()
}
