use crate::types::ProtocolError;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

pub async fn timeout_result<F, T>(duration: Option<Duration>, future: F) -> Result<T, ProtocolError>
where
    F: Future<Output = Result<T, ProtocolError>>,
{
    if let Some(dur) = duration {
        match timeout(dur, future).await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::Timeout),
        }
    } else {
        future.await
    }
}
