//! Shared test fixtures.
//!
//! Real runs shell out to the platform volume manager; tests install a stub
//! `zfs` executable backed by a flat property table so no pool is needed.
//! `split` and `cat` are the real coreutils.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use snapkeep::Host;

const STUB_ZFS: &str = r#"#!/bin/sh
# stub zfs backed by a flat property table
STATE="__STATE__"
PROPS="$STATE/props.tsv"
cmd="$1"
shift
case "$cmd" in
get)
    cat "$PROPS" 2>/dev/null
    ;;
list)
    cat "$STATE/filesystems" 2>/dev/null
    ;;
snapshot)
    props=""
    while [ $# -gt 1 ]; do
        case "$1" in
        -o)
            props="$props $2"
            shift 2
            ;;
        *)
            shift
            ;;
        esac
    done
    name="$1"
    for kv in $props; do
        printf '%s\t%s\t%s\n' "$name" "${kv%%=*}" "${kv#*=}" >>"$PROPS"
    done
    printf '%s\tcreation\t0\n' "$name" >>"$PROPS"
    ;;
destroy)
    for arg in "$@"; do name="$arg"; done
    awk -F'\t' -v n="$name" '$1 != n' "$PROPS" >"$PROPS.tmp"
    mv "$PROPS.tmp" "$PROPS"
    ;;
set)
    kv="$1"
    name="$2"
    k="${kv%%=*}"
    v="${kv#*=}"
    awk -F'\t' -v n="$name" -v k="$k" '!($1 == n && $2 == k)' "$PROPS" >"$PROPS.tmp"
    mv "$PROPS.tmp" "$PROPS"
    printf '%s\t%s\t%s\n' "$name" "$k" "$v" >>"$PROPS"
    ;;
inherit)
    k="$1"
    name="$2"
    awk -F'\t' -v n="$name" -v k="$k" '!($1 == n && $2 == k)' "$PROPS" >"$PROPS.tmp"
    mv "$PROPS.tmp" "$PROPS"
    ;;
send)
    for arg in "$@"; do name="$arg"; done
    short="${name#*@}"
    printf 'SNAP:%s\n' "$short"
    i=0
    while [ $i -lt 20 ]; do
        printf 'payload-%s-line-%s\n' "$short" "$i"
        i=$((i + 1))
    done
    ;;
receive)
    for arg in "$@"; do fs="$arg"; done
    tmp="$STATE/incoming.$$"
    cat >"$tmp"
    short=$(head -n 1 "$tmp" | cut -d: -f2)
    printf '%s@%s\tcreation\t0\n' "$fs" "$short" >>"$PROPS"
    printf '%s@%s\n' "$fs" "$short" >>"$STATE/received"
    echo "received stream into $fs@$short"
    ;;
esac
exit 0
"#;

/// Installs a stub `zfs` into `state` and returns a host wired to it. The
/// given filesystems pre-exist on the stub.
pub fn stub_host(state: &Path, filesystems: &[&str]) -> Arc<Host> {
    fs::create_dir_all(state).expect("create state dir");

    let mut fs_list = String::new();
    let mut props = String::new();
    for name in filesystems {
        fs_list.push_str(name);
        fs_list.push('\n');
        props.push_str(&format!("{}\ttype\tfilesystem\n", name));
    }
    fs::write(state.join("filesystems"), fs_list).expect("write filesystems");
    fs::write(state.join("props.tsv"), props).expect("write props");

    let script = state.join("zfs");
    fs::write(&script, STUB_ZFS.replace("__STATE__", &state.display().to_string()))
        .expect("write stub zfs");
    let mut perms = fs::metadata(&script).expect("stat stub zfs").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&script, perms).expect("chmod stub zfs");

    let mut cmds = HashMap::new();
    cmds.insert("zfs".to_string(), script.display().to_string());
    Arc::new(Host::new(cmds, None))
}

/// Appends one property line to a stub host's table, bypassing the tool.
pub fn seed_property(state: &Path, dataset: &str, property: &str, value: &str) {
    let path = state.join("props.tsv");
    let mut content = fs::read_to_string(&path).unwrap_or_default();
    content.push_str(&format!("{}\t{}\t{}\n", dataset, property, value));
    fs::write(&path, content).expect("write props");
}

/// Whether the stub host's table carries the given (dataset, property,
/// value) triple.
pub fn has_property(state: &Path, dataset: &str, property: &str, value: &str) -> bool {
    let line = format!("{}\t{}\t{}", dataset, property, value);
    fs::read_to_string(state.join("props.tsv"))
        .unwrap_or_default()
        .lines()
        .any(|l| l == line)
}

/// Snapshot names currently present on a stub host, sorted.
pub fn snapshot_names(state: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_to_string(state.join("props.tsv"))
        .unwrap_or_default()
        .lines()
        .filter_map(|l| l.split('\t').next())
        .filter(|name| name.contains('@'))
        .map(str::to_string)
        .collect();
    names.sort();
    names.dedup();
    names
}

/// Names of regular files directly under a directory, sorted.
pub fn dir_entries(dir: &Path) -> Vec<String> {
    let mut entries: Vec<String> = fs::read_dir(dir)
        .expect("read dir")
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    entries.sort();
    entries
}

pub fn transfer_dir(root: &Path) -> PathBuf {
    let dir = root.join("transfer");
    fs::create_dir_all(&dir).expect("create transfer dir");
    dir
}
