//! Local Docker daemon access: origin pulls through the cli,
//! archive export / load through the api.

use std::path::Path;

use anyhow::Context;
use bollard::Docker;
use command::{CommandLog, run_standard_command};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

pub struct DockerClient {
  docker: Docker,
}

impl DockerClient {
  pub fn connect() -> anyhow::Result<DockerClient> {
    let docker = Docker::connect_with_defaults().context(
      "Failed to connect to docker api. Image replication will not work on this node.",
    )?;
    Ok(DockerClient { docker })
  }

  /// Pull from the origin registry (or mirror, when the image
  /// reference carries the mirror domain).
  pub async fn pull(&self, image: &str) -> CommandLog {
    let command = format!("docker pull {image}");
    run_standard_command("Docker Pull", None, command).await
  }

  pub async fn image_present(&self, image: &str) -> bool {
    self.docker.inspect_image(image).await.is_ok()
  }

  /// `docker save` the image into a tar archive.
  pub async fn export(
    &self,
    image: &str,
    destination: &Path,
  ) -> anyhow::Result<()> {
    let mut file = tokio::fs::File::create(destination)
      .await
      .with_context(|| {
        format!("failed to create {}", destination.display())
      })?;
    let mut stream = self.docker.export_image(image);
    while let Some(chunk) = stream.next().await {
      let chunk =
        chunk.context("image export stream failed")?;
      file.write_all(&chunk).await.with_context(|| {
        format!("failed to write {}", destination.display())
      })?;
    }
    file.flush().await.ok();
    Ok(())
  }

  /// `docker load` an archive received from peers.
  pub async fn load(
    &self,
    archive: &Path,
  ) -> anyhow::Result<()> {
    let command =
      format!("docker load -i {}", archive.display());
    let log =
      run_standard_command("Docker Load", None, command).await;
    if !log.success {
      anyhow::bail!(
        "docker load of {} failed | {}",
        archive.display(),
        log.stderr
      );
    }
    Ok(())
  }
}
