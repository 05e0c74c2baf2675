use args::Args;
use getopts::Occur;
use glob::glob;
use log::info;
use malloc_leaks::LeakReport;
use std::fs;

const PROGRAM_DESC: &str = "Print malloc_leaks report dumps";
const PROGRAM_NAME: &str = "ml_print";

fn main() -> Result<(), anyhow::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = Args::new(PROGRAM_NAME, PROGRAM_DESC);
    args.option(
        "d",
        "dir",
        "Directory that stores report dumps",
        "DIR",
        Occur::Req,
        None,
    );
    args.flag("s", "symbols", "Show symbol names of leak origins");

    args.parse_from_cli()?;

    let dir: String = args.value_of("dir")?;
    let symbols: bool = args.value_of("symbols")?;
    let wildcard = format!("{}/malloc_leaks.*.yaml", dir);

    let mut found = 0;
    for path in glob(wildcard.as_str())? {
        let path = path?;
        info!("found report in {}", path.display());
        let report_bytes = fs::read(&path)?;
        let report = serde_yaml::from_slice::<LeakReport>(&report_bytes[..])?;
        if symbols {
            print!("{}", report.with_symbols());
        } else {
            print!("{}", report);
        }
        found += 1;
    }

    if found == 0 {
        anyhow::bail!("no report dumps found in {}", dir);
    }

    Ok(())
}
