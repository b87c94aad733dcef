use std::io::{self, BufRead, Write};

use async_trait::async_trait;
use patchfleet_core::PatchError;
use patchfleet_executor::{AuthProtocol, FallbackApprover};
use tokio::sync::Mutex;
use tracing::warn;

/// Asks on the terminal before a host is retried with the fallback
/// protocol. Prompts from concurrent hosts are asked one at a time.
#[derive(Debug, Default)]
pub struct TerminalApprover {
    prompt_lock: Mutex<()>,
}

#[async_trait]
impl FallbackApprover for TerminalApprover {
    async fn approve(
        &self,
        host: &str,
        primary: AuthProtocol,
        fallback: AuthProtocol,
        error: &PatchError,
    ) -> bool {
        let _guard = self.prompt_lock.lock().await;
        let question = format!(
            "{host}: {primary} failed ({error}). Retry with {fallback}? [y/N] "
        );

        let answer = tokio::task::spawn_blocking(move || -> io::Result<String> {
            let mut stderr = io::stderr();
            stderr.write_all(question.as_bytes())?;
            stderr.flush()?;
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line)?;
            Ok(line)
        })
        .await;

        match answer {
            Ok(Ok(line)) => is_yes(&line),
            Ok(Err(err)) => {
                warn!(host, error = %err, "could not read fallback confirmation");
                false
            }
            Err(err) => {
                warn!(host, error = %err, "fallback prompt did not complete");
                false
            }
        }
    }
}

pub fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
