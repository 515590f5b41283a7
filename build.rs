use std::fs;
use std::path::{Path, PathBuf};

/// Tokens that would give the fitting core I/O or a terminal of its own.
const FORBIDDEN: &[&str] = &[
    "std::fs",
    "std::net",
    "std::process",
    "std::env",
    "println!(",
    "eprintln!(",
];

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=src");

    let mut sources = Vec::new();
    collect_sources(Path::new("src"), &mut sources);
    sources.sort();

    let offending: Vec<String> = sources
        .iter()
        .filter_map(|path| Some((path, fs::read_to_string(path).ok()?)))
        .flat_map(|(path, text)| {
            text.lines()
                .enumerate()
                .filter_map(|(idx, line)| {
                    let token = FORBIDDEN.iter().find(|t| line.contains(*t))?;
                    Some(format!("{}:{}: `{token}`", path.display(), idx + 1))
                })
                .collect::<Vec<_>>()
        })
        .collect();

    if !offending.is_empty() {
        panic!(
            "spline fitting core must stay computation-only:\n  {}",
            offending.join("\n  ")
        );
    }
}

fn collect_sources(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for path in entries.flatten().map(|e| e.path()) {
        if path.is_dir() {
            collect_sources(&path, out);
        } else if path.extension().is_some_and(|ext| ext == "rs") {
            out.push(path);
        }
    }
}
