use std::io::{self, Write};

use env_logger::Builder;
use tokio::{
    fs::{create_dir_all, metadata, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::{
        mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
        watch,
    },
    task::JoinHandle,
};

use crate::{config, core::PipelineResult};

pub struct AsyncWriter {
    sender: UnboundedSender<Vec<u8>>,
}

impl Write for AsyncWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let data = buf.to_vec();
        self.sender.send(data).map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// File logger: `env_logger` formats records into a channel and a
/// background task appends them to the configured file.
pub struct Logger {
    sender: UnboundedSender<Vec<u8>>,
    receiver: UnboundedReceiver<Vec<u8>>,
    config: config::Log,
}

impl Logger {
    pub fn new(config: config::Log) -> Self {
        let (sender, receiver) = unbounded_channel::<Vec<u8>>();
        Self {
            sender,
            receiver,
            config,
        }
    }

    fn create_async_writer(&self) -> AsyncWriter {
        AsyncWriter {
            sender: self.sender.clone(),
        }
    }

    /// Install the global logger. `RUST_LOG` still overrides the configured
    /// level.
    pub fn init_env_logger(&self) {
        let writer = self.create_async_writer();
        Builder::from_env(
            env_logger::Env::default().default_filter_or(self.config.level_filter().as_str()),
        )
        .target(env_logger::Target::Pipe(Box::new(writer)))
        .init();
    }

    /// Drain the channel into the log file until `shutdown` flips to true
    /// or every writer is gone.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let path = self.config.path.clone();
            if let Err(e) = self.run(shutdown).await {
                eprintln!("Log writer for {path} stopped: {e}");
            }
        })
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> PipelineResult<()> {
        let log_file_path = &self.config.path;

        if let Some(parent) = std::path::Path::new(log_file_path).parent() {
            if !parent.as_os_str().is_empty() && metadata(parent).await.is_err() {
                create_dir_all(parent).await?;
            }
        }

        let mut file = BufWriter::new(
            OpenOptions::new()
                .append(true)
                .create(true)
                .open(log_file_path)
                .await?,
        );

        loop {
            tokio::select! {
                biased;
                // Shutdown signal handling
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        log::info!("Shutdown signal received, stopping write log");
                        break;
                    }
                },

                data = self.receiver.recv() => {
                    match data {
                        Some(data) => {
                            if let Err(e) = file.write_all(&data).await {
                                eprintln!("Failed to write to log file: {e}");
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        // keep whatever was queued before shutdown
        while let Ok(data) = self.receiver.try_recv() {
            file.write_all(&data).await?;
        }
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_writer_drains_into_file() {
        let dir = std::env::temp_dir().join(format!("tierflow-log-{}", uuid::Uuid::new_v4()));
        let path = dir.join("nested").join("app.log");
        let logger = Logger::new(config::Log {
            path: path.to_string_lossy().to_string(),
            level: "info".to_string(),
        });

        let mut writer = logger.create_async_writer();
        let (tx, rx) = watch::channel(false);
        let handle = logger.spawn(rx);

        writer.write_all(b"first line\n").unwrap();
        writer.write_all(b"second line\n").unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let written = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(written, "first line\nsecond line\n");
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
