//! Test helpers: stand-in `initdb` and `postgres` programs and cluster fixtures
#![allow(dead_code)]

use ghostgres::{ConfigOpt, FailureObserver, PostgresCluster};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Accepts the arguments `PostgresCluster::init` passes, records which
/// password file it was given and lays out a minimal data directory.
/// `--fail` makes it exit with an error after recording the password file.
const FAKE_INITDB: &str = r##"#!/bin/sh
pgdata=""
pwfile=""
fail=""
while [ $# -gt 0 ]; do
    case "$1" in
        --pgdata) pgdata="$2"; shift 2 ;;
        --pwfile) pwfile="$2"; shift 2 ;;
        --fail) fail=1; shift ;;
        *) shift ;;
    esac
done
mkdir -p "$pgdata/base/1" "$pgdata/global" || exit 1
chmod 700 "$pgdata"
echo "$pwfile" > "$pgdata/pwfile_path"
if [ -n "$fail" ]; then
    echo "initdb: forced failure" >&2
    exit 1
fi
if [ ! -r "$pwfile" ]; then
    echo "initdb: could not read password file \"$pwfile\"" >&2
    exit 1
fi
cp "$pwfile" "$pgdata/pwfile_copy"
echo "9.3" > "$pgdata/PG_VERSION"
: > "$pgdata/pg_hba.conf"
head -c 4096 /dev/zero > "$pgdata/base/1/1259"
echo "# initdb generated" > "$pgdata/postgresql.conf"
echo "Success. You can now start the database server"
"##;

/// Creates `<socket dir>/.s.PGSQL.<port>` from the port in the config file,
/// removes it on shutdown. SIGTERM exits 0, SIGINT exits 2 and any unknown
/// `--` flag fails immediately.
const FAKE_POSTGRES: &str = r#"#!/bin/sh
if [ "$1" = "--version" ]; then
    echo "postgres (PostgreSQL) 9.3.4"
    exit 0
fi
sockdir=""
conf=""
while [ $# -gt 0 ]; do
    case "$1" in
        -k) sockdir="$2"; shift 2 ;;
        -D) shift 2 ;;
        -c)
            case "$2" in
                config_file=*) conf="${2#config_file=}" ;;
            esac
            shift 2 ;;
        --*) echo "postgres: invalid option -- '$1'" >&2; exit 1 ;;
        *) shift ;;
    esac
done
port=$(sed -n 's/^port = \([0-9][0-9]*\).*/\1/p' "$conf" | head -n 1)
sock="$sockdir/.s.PGSQL.${port:-5432}"
trap 'rm -f "$sock"; exit 0' TERM
trap 'rm -f "$sock"; exit 2' INT
: > "$sock"
echo "database system is ready to accept connections" >&2
while :; do
    sleep 1 >/dev/null 2>&1 &
    wait $!
done
"#;

/// Prints a version string without a patch component
const FAKE_POSTGRES_TWO_PART_VERSION: &str = r#"#!/bin/sh
echo "postgres (PostgreSQL) 16.2"
"#;

// Written once per test binary, before any test spawns a process, so no
// forked child can hold a script open for writing when it is executed.
static FAKE_BIN_DIR: Lazy<PathBuf> = Lazy::new(|| {
    let dir = PathBuf::from(env!("CARGO_TARGET_TMPDIR"))
        .join(format!("ghostgres-fake-bin-{}", std::process::id()));
    let odd_dir = dir.join("two-part-version");
    std::fs::create_dir_all(&odd_dir).unwrap();
    write_script(&dir.join("initdb"), FAKE_INITDB);
    write_script(&dir.join("postgres"), FAKE_POSTGRES);
    write_script(&odd_dir.join("postgres"), FAKE_POSTGRES_TWO_PART_VERSION);
    dir
});

fn write_script(path: &Path, body: &str) {
    std::fs::write(path, body).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// Directory holding the stand-in `initdb` and `postgres`
pub fn fake_bin_dir() -> PathBuf {
    FAKE_BIN_DIR.clone()
}

/// A `postgres` whose version output has no patch component
pub fn two_part_version_bin_dir() -> PathBuf {
    FAKE_BIN_DIR.join("two-part-version")
}

pub fn test_config() -> Vec<ConfigOpt> {
    vec![
        ConfigOpt::new("port", "10000").with_comment("Different port for testing local sockets"),
        ConfigOpt::new("listen_addresses", "''").with_comment("Don't listen on TCP"),
        ConfigOpt::new("autovacuum", "off").with_comment("Don't run autovacuum"),
        ConfigOpt::new("fsync", "off"),
    ]
}

/// An uninitialized cluster using the stand-in binaries
pub fn test_cluster(data_dir: &Path) -> PostgresCluster {
    PostgresCluster::new(data_dir, fake_bin_dir())
        .with_config(test_config())
        .with_password("This is random")
}

/// An initialized cluster using the stand-in binaries
pub async fn initdb(data_dir: &Path) -> PostgresCluster {
    let mut cluster = test_cluster(data_dir);
    cluster.init().await.unwrap();
    cluster
}

/// Observer that records the message of every error it is shown
pub fn recording_observer() -> (FailureObserver, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let observer: FailureObserver = Arc::new(move |e| sink.lock().push(e.to_string()));
    (observer, seen)
}

/// Snapshot of every regular file under `root`, keyed by relative path
pub fn tree_contents(root: &Path) -> Vec<(PathBuf, Vec<u8>)> {
    let mut files: Vec<_> = walkdir::WalkDir::new(root)
        .into_iter()
        .map(|e| e.unwrap())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e.path().strip_prefix(root).unwrap().to_path_buf();
            (rel, std::fs::read(e.path()).unwrap())
        })
        .collect();
    files.sort();
    files
}
