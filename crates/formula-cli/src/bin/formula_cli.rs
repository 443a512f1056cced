fn main() -> anyhow::Result<()> {
    formula_cli::cli::run()
}
