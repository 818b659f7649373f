// 统一处理退出信号，收到后取消进行中的压测。
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("listen for ctrl-c failed: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!("register SIGTERM listener failed: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Cancels `token` on the first exit signal.
pub fn cancel_on_shutdown(token: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown_signal() => {
                info!("exit signal received, stopping the test");
                token.cancel();
            }
            _ = token.cancelled() => {}
        }
    });
}
