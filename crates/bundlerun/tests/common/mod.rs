#![allow(clippy::unwrap_used)]

//! Shared fixtures: a stand-in for the system `open` tool and a minimal app
//! bundle for it to start.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Understands the flags the launcher passes and runs
/// `<app>/Contents/MacOS/<name>` with its stdio wired to the named pipes.
const FAKE_OPEN: &str = r#"#!/bin/sh
while [ $# -gt 0 ]; do
  case "$1" in
    -n|-W) shift ;;
    -a) app="$2"; shift 2 ;;
    --env) export "$2"; shift 2 ;;
    --stdin) in="$2"; shift 2 ;;
    --stdout) out="$2"; shift 2 ;;
    --stderr) err="$2"; shift 2 ;;
    --args) shift; break ;;
    *) echo "fake open: unexpected argument $1" >&2; exit 64 ;;
  esac
done
name=$(basename "$app" .app)
exec "$app/Contents/MacOS/$name" "$@" <"$in" >"$out" 2>"$err"
"#;

fn write_script(path: &Path, body: &str) {
    std::fs::write(path, body).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

pub fn write_fake_open(dir: &Path) -> PathBuf {
    let path = dir.join("open");
    write_script(&path, FAKE_OPEN);
    path
}

/// Create `<dir>/<name>.app` whose executable is the given shell script body.
pub fn write_bundle(dir: &Path, name: &str, script: &str) -> PathBuf {
    let app = dir.join(format!("{name}.app"));
    let macos = app.join("Contents").join("MacOS");
    std::fs::create_dir_all(&macos).unwrap();
    write_script(&macos.join(name), &format!("#!/bin/sh\n{script}\n"));
    app
}

pub fn dir_is_empty(dir: &Path) -> bool {
    std::fs::read_dir(dir).unwrap().next().is_none()
}
