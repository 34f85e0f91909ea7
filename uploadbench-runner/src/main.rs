use anyhow::Result;

fn main() -> Result<()> {
    uploadbench_runner::cli::execute()
}
