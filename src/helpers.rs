use std::{future::Future, pin::Pin};

use axum::{http::StatusCode, response::IntoResponse};
use futures::future;
use tokio::signal;
use tracing::info;

pub async fn handler_404() -> impl IntoResponse {
    // classic go 404
    (StatusCode::NOT_FOUND, "404 page not found")
}

pub async fn do_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install ctrl+c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("starting graceful shutdown...");
}

/// Collects shutdown futures for background tasks and runs them together.
pub struct Closer {
    closers: Vec<Pin<Box<dyn Future<Output = ()> + Send + 'static>>>,
}

impl Closer {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            closers: Vec::new(),
        }
    }

    pub fn add<F>(&mut self, f: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.closers.push(Box::pin(f));
    }

    pub async fn close(self) {
        future::join_all(self.closers).await;
    }
}

/// Quote an argument for display if it would not survive whitespace splitting.
pub fn display_arg(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_owned();
    }
    if arg.chars().any(|c| c.is_whitespace() || c == '\'' || c == '"') {
        format!("'{}'", arg.replace('\'', r"'\''"))
    } else {
        arg.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    #[tokio::test]
    async fn closer_runs_every_registered_future() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut closer = Closer::new();
        for _ in 0..3 {
            let hits = Arc::clone(&hits);
            closer.add(async move {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        closer.close().await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn display_arg_quotes_only_when_needed() {
        assert_eq!(display_arg("in.mp4"), "in.mp4");
        assert_eq!(display_arg("my clip.mp4"), "'my clip.mp4'");
        assert_eq!(display_arg("it's.mp4"), r"'it'\''s.mp4'");
        assert_eq!(display_arg(""), "''");
    }
}
