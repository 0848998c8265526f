use anyhow::Result;

fn main() -> Result<()> {
    scriptgate::cli::run()
}
