use crate::error::Result;

/// Broadcast token used to stop every background task owned by a node.
#[derive(Debug)]
pub struct Shutdown(
    tokio::sync::broadcast::Sender<()>,
    tokio::sync::broadcast::Receiver<()>,
);

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = tokio::sync::broadcast::channel(1);
        Shutdown(tx, rx)
    }

    pub fn shutdown(&self) {
        // no receivers left means everything already stopped
        let _ = self.0.send(());
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<()> {
        self.0.subscribe()
    }

    pub async fn wait(&mut self) -> Result<()> {
        match self.1.recv().await {
            Ok(()) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => Ok(()),
            Err(tokio::sync::broadcast::error::RecvError::Closed) => Ok(()),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Shutdown::new()
    }
}

impl Clone for Shutdown {
    fn clone(&self) -> Self {
        Shutdown(self.0.clone(), self.0.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::Shutdown;

    #[tokio::test]
    async fn clones_observe_shutdown() {
        let shutdown = Shutdown::new();
        let mut other = shutdown.clone();
        shutdown.shutdown();
        other.wait().await.unwrap();
    }
}
