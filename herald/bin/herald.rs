#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = herald::find_config_file()?;
    let herald = herald::Herald::from_file(&config_path)?;

    herald.run().await
}
