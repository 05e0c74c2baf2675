use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use malloc_leaks::{config::DUMP_DIR_VAR, config::OUTPUT_VAR, LeakReport};

// The library is built next to the demo binary.
fn preload_library() -> Option<PathBuf> {
    let dir = Path::new(env!("CARGO_BIN_EXE_leak_demo")).parent()?;
    [dir.to_path_buf(), dir.join("deps")]
        .iter()
        .map(|d| d.join("libmalloc_leaks_preload.so"))
        .find(|lib| lib.exists())
}

fn run_demo(dir: &Path) -> Option<(String, LeakReport)> {
    let lib = match preload_library() {
        Some(lib) => lib,
        None => {
            eprintln!("libmalloc_leaks_preload.so not built, skipping");
            return None;
        }
    };
    let output = dir.join("report.txt");
    let status = Command::new(env!("CARGO_BIN_EXE_leak_demo"))
        .env("LD_PRELOAD", &lib)
        .env(OUTPUT_VAR, &output)
        .env(DUMP_DIR_VAR, dir)
        .status()
        .unwrap();
    assert!(status.success());

    let text = fs::read_to_string(&output).unwrap();
    let dump = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .find(|path| path.extension().is_some_and(|ext| ext == "yaml"))
        .unwrap();
    let report = serde_yaml::from_slice(&fs::read(dump).unwrap()).unwrap();
    Some((text, report))
}

#[cfg(target_env = "gnu")]
#[test]
fn report_follows_program_finalizers() {
    let dir = tempfile::tempdir().unwrap();
    let Some((text, report)) = run_demo(dir.path()) else {
        return;
    };

    let leaked = report
        .leaks
        .iter()
        .find(|leak| leak.size == 64 && leak.bytes == [0xa5; 64])
        .unwrap_or_else(|| panic!("64-byte leak missing from:\n{}", text));
    assert!(text.contains(&format!("Address  : {:#x}", leaked.address)));

    // Freed by the program's own finalizer, which runs before the report.
    assert!(!report
        .leaks
        .iter()
        .any(|leak| leak.size == 48 && leak.bytes == [0x5a; 48]));
}

#[cfg(target_env = "gnu")]
#[test]
fn leak_is_attributed_to_the_allocating_function() {
    let dir = tempfile::tempdir().unwrap();
    let Some((_, report)) = run_demo(dir.path()) else {
        return;
    };

    let leaked = report
        .leaks
        .iter()
        .find(|leak| leak.size == 64 && leak.bytes == [0xa5; 64])
        .unwrap();
    let caller = leaked.caller.unwrap();
    let symbol = &report.symbols[&caller];
    assert!(symbol.contains("leak_in_helper"), "caller resolved to {}", symbol);
}
