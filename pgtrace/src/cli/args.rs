//! CLI argument definitions

use clap::{Parser, ValueEnum};
use pgtrace_common::{StackSites, TraceFamilies};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "pgtrace",
    about = "Trace lock operations of a running PostgreSQL server via eBPF",
    after_help = "\
EXAMPLES:
    sudo pgtrace -x /usr/lib/postgresql/15/bin/postgres --postgres-version 15 -p 1234
    sudo pgtrace -x ./bin/postgres --postgres-version 16 -p 1234 -p 5678 -j
    sudo pgtrace -x ./bin/postgres --postgres-version 15 -p 1234 -s DEADLOCK LOCK
    sudo pgtrace -x ./bin/postgres --postgres-version 15 -p 1234 -t TRANSACTION QUERY
    sudo pgtrace -x ./bin/postgres --postgres-version 15 -p 1234 --statistics"
)]
pub struct Args {
    /// Process id(s) to trace (repeatable)
    #[arg(short, long = "pid", value_name = "PID", required = true, num_args = 1..)]
    pub pids: Vec<i32>,

    /// Path to the postgres binary the pids run
    #[arg(short = 'x', long = "exe", value_name = "PATH")]
    pub exe: String,

    /// Server major version (selects the struct layout tables)
    #[arg(long = "postgres-version", value_name = "VERSION")]
    pub postgres_version: String,

    /// Generate output as JSON data
    #[arg(short, long)]
    pub json: bool,

    /// Write the trace into an output file instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Event families to trace (default: TRANSACTION QUERY TABLE LOCK ERROR)
    #[arg(short = 't', long = "trace", value_enum, num_args = 1..)]
    pub trace: Option<Vec<FamilyArg>>,

    /// Capture a stacktrace on these events
    #[arg(short = 's', long = "stacktrace", value_enum, num_args = 1..)]
    pub stacktrace: Option<Vec<StackArg>>,

    /// Minimum severity for ERROR events (elog.h level, 21 = ERROR)
    #[arg(long, default_value_t = pgtrace_common::events::DEFAULT_ERROR_THRESHOLD)]
    pub error_level: i32,

    /// Print lock statistics on exit
    #[arg(long)]
    pub statistics: bool,

    /// Be verbose
    #[arg(short, long)]
    pub verbose: bool,

    /// Load and attach everything, then exit immediately
    #[arg(short = 'd', long)]
    pub dry_run: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FamilyArg {
    Transaction,
    Query,
    Table,
    Lock,
    Error,
    RowLock,
    LwLock,
    SpinDelay,
}

impl FamilyArg {
    #[must_use]
    pub fn family(self) -> TraceFamilies {
        match self {
            FamilyArg::Transaction => TraceFamilies::TRANSACTION,
            FamilyArg::Query => TraceFamilies::QUERY,
            FamilyArg::Table => TraceFamilies::TABLE,
            FamilyArg::Lock => TraceFamilies::LOCK,
            FamilyArg::Error => TraceFamilies::ERROR,
            FamilyArg::RowLock => TraceFamilies::ROW_LOCK,
            FamilyArg::LwLock => TraceFamilies::LW_LOCK,
            FamilyArg::SpinDelay => TraceFamilies::SPIN_DELAY,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StackArg {
    Deadlock,
    Lock,
    Unlock,
}

impl StackArg {
    #[must_use]
    pub fn sites(self) -> StackSites {
        match self {
            StackArg::Deadlock => StackSites::DEADLOCK,
            StackArg::Lock => StackSites::ACQUIRE,
            StackArg::Unlock => StackSites::RELEASE,
        }
    }
}

impl Args {
    /// The classic tracer families; row locks, lightweight locks and spin
    /// delays are opt-in (lwlock probes need a `--enable-dtrace` build).
    #[must_use]
    pub fn families(&self) -> TraceFamilies {
        match &self.trace {
            None => TraceFamilies::TRANSACTION
                .with(TraceFamilies::QUERY)
                .with(TraceFamilies::TABLE)
                .with(TraceFamilies::LOCK)
                .with(TraceFamilies::ERROR),
            Some(list) => list
                .iter()
                .fold(TraceFamilies::empty(), |acc, f| acc.with(f.family())),
        }
    }

    #[must_use]
    pub fn stack_sites(&self) -> StackSites {
        self.stacktrace
            .iter()
            .flatten()
            .fold(StackSites::empty(), |acc, s| acc.with(s.sites()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn default_families_are_the_classic_set() {
        let args =
            Args::parse_from(["pgtrace", "-p", "1", "-x", "/bin/postgres", "--postgres-version", "15"]);
        let families = args.families();
        assert!(families.contains(TraceFamilies::LOCK));
        assert!(families.contains(TraceFamilies::QUERY));
        assert!(!families.contains(TraceFamilies::LW_LOCK));
    }

    #[test]
    fn explicit_trace_selection_overrides_the_default() {
        let args = Args::parse_from([
            "pgtrace",
            "-p",
            "1",
            "-x",
            "/bin/postgres",
            "--postgres-version",
            "15",
            "-t",
            "ROW_LOCK",
            "LW_LOCK",
        ]);
        let families = args.families();
        assert!(families.contains(TraceFamilies::ROW_LOCK));
        assert!(families.contains(TraceFamilies::LW_LOCK));
        assert!(!families.contains(TraceFamilies::LOCK));
    }

    #[test]
    fn stack_sites_accumulate() {
        let args = Args::parse_from([
            "pgtrace",
            "-p",
            "1",
            "-x",
            "/bin/postgres",
            "--postgres-version",
            "15",
            "-s",
            "LOCK",
            "DEADLOCK",
        ]);
        let sites = args.stack_sites();
        assert!(sites.contains(StackSites::ACQUIRE));
        assert!(sites.contains(StackSites::DEADLOCK));
        assert!(!sites.contains(StackSites::RELEASE));
    }

    #[test]
    fn multiple_pids_accumulate() {
        let args = Args::parse_from([
            "pgtrace",
            "-p",
            "10",
            "-p",
            "20",
            "-x",
            "/bin/postgres",
            "--postgres-version",
            "16",
        ]);
        assert_eq!(args.pids, vec![10, 20]);
    }
}
