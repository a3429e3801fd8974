fn main() -> anyhow::Result<()> {
    token_guard::cli::run()
}
