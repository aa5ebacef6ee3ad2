use color_eyre::{eyre::bail, Result};
use essential_core::{
    installation::{IdSource, InstallationIdStore, Resolution, INSTALLATION_ID_KEY},
    storage::SecureStore,
};
use tracing::{info, warn};

/// Print the installation id, creating it on first use.
pub async fn print<S: SecureStore>(
    ids: &InstallationIdStore<S>,
    strict: bool,
    json: bool,
) -> Result<()> {
    let resolution = resolve(ids, strict).await?;
    println!("{}", render(&resolution, json)?);
    Ok(())
}

/// Print the stored id, if any, without creating one.
pub async fn show<S: SecureStore>(ids: &InstallationIdStore<S>) -> Result<()> {
    match ids
        .current(INSTALLATION_ID_KEY)
        .await
        .map_err(|e| color_eyre::eyre::eyre!(e.to_string()))?
    {
        Some(id) => println!("{id}"),
        None => println!("No installation id stored yet. Create one with `essential id`."),
    }
    Ok(())
}

/// Wipe the stored id, the way an uninstall would.
pub async fn reset<S: SecureStore>(ids: &InstallationIdStore<S>, confirmed: bool) -> Result<()> {
    wipe(ids, confirmed).await?;
    println!("Installation id removed. The next `essential id` creates a new one.");
    Ok(())
}

async fn resolve<S: SecureStore>(ids: &InstallationIdStore<S>, strict: bool) -> Result<Resolution> {
    let resolution = ids.get_or_create(INSTALLATION_ID_KEY).await;
    match &resolution.source {
        IdSource::Ephemeral(err) if strict => bail!("installation id was not persisted: {err}"),
        IdSource::Ephemeral(err) => {
            warn!(error = %err, "installation id is not durable and may change on the next run")
        }
        IdSource::Created => info!("created new installation id"),
        IdSource::Existing => {}
    }
    Ok(resolution)
}

fn render(resolution: &Resolution, json: bool) -> Result<String> {
    if json {
        return Ok(serde_json::to_string(resolution)?);
    }
    Ok(resolution.id.clone())
}

async fn wipe<S: SecureStore>(ids: &InstallationIdStore<S>, confirmed: bool) -> Result<()> {
    if !confirmed {
        bail!("refusing to remove the installation id without --yes");
    }
    ids.store()
        .delete(INSTALLATION_ID_KEY)
        .await
        .map_err(|e| color_eyre::eyre::eyre!(e.to_string()))
}
