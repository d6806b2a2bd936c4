//! Confirmation gate for destructive tasks

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait Confirm: Send {
    /// `true` only on an explicit yes
    async fn confirm(&mut self, prompt: &str) -> bool;
}

/// `--yes`: every gate passes without asking
pub struct AssumeYes;

#[async_trait]
impl Confirm for AssumeYes {
    async fn confirm(&mut self, prompt: &str) -> bool {
        log::info!("{} [y/N]: y (--yes)", prompt);
        true
    }
}

/// Interactive yes/no prompt. Anything but `y`/`yes` declines, including an
/// empty line, end of input, a read error or the timeout expiring. An
/// interrupt while waiting also declines.
pub struct PromptConfirm<R, W> {
    input: R,
    output: W,
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl<R, W> PromptConfirm<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(input: R, output: W) -> Self {
        Self {
            input,
            output,
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Stop waiting for an answer once `cancel` fires
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    async fn read_answer(&mut self) -> Option<String> {
        let mut line = String::new();
        let input = &mut self.input;
        let timeout = self.timeout;
        let read = async {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, input.read_line(&mut line))
                    .await
                    .ok()?
                    .ok(),
                None => input.read_line(&mut line).await.ok(),
            }
        };
        let count = tokio::select! {
            count = read => count?,
            _ = self.cancel.cancelled() => return None,
        };
        (count > 0).then_some(line)
    }
}

impl PromptConfirm<tokio::io::BufReader<tokio::io::Stdin>, tokio::io::Stderr> {
    /// Prompt on stderr, answer from stdin
    pub fn stdio() -> Self {
        Self::new(
            tokio::io::BufReader::new(tokio::io::stdin()),
            tokio::io::stderr(),
        )
    }
}

/// Whether a typed answer counts as yes
pub fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

#[async_trait]
impl<R, W> Confirm for PromptConfirm<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn confirm(&mut self, prompt: &str) -> bool {
        let question = format!("{} [y/N]: ", prompt);
        if self.output.write_all(question.as_bytes()).await.is_err() {
            return false;
        }
        let _ = self.output.flush().await;

        match self.read_answer().await {
            Some(answer) => is_affirmative(&answer),
            None => {
                let _ = self.output.write_all(b"\n").await;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn answer(input: &'static [u8]) -> (bool, String) {
        let mut output = Vec::new();
        let accepted = PromptConfirm::new(input, &mut output)
            .confirm("Destroy cluster eks-cis?")
            .await;
        (accepted, String::from_utf8(output).unwrap())
    }

    #[tokio::test]
    async fn test_only_yes_proceeds() {
        let (accepted, shown) = answer(b"y\n").await;
        assert!(accepted);
        assert_eq!(shown, "Destroy cluster eks-cis? [y/N]: ");

        assert!(answer(b"YES\n").await.0);
        assert!(!answer(b"\n").await.0);
        assert!(!answer(b"n\n").await.0);
        assert!(!answer(b"yep\n").await.0);
        assert!(!answer(b"").await.0);
    }

    #[tokio::test]
    async fn test_timeout_declines() {
        let (reader, _writer) = tokio::io::duplex(64);
        let mut gate = PromptConfirm::new(tokio::io::BufReader::new(reader), tokio::io::sink())
            .with_timeout(Duration::from_millis(50));
        assert!(!gate.confirm("Tear down?").await);
    }

    #[tokio::test]
    async fn test_interrupt_declines_without_answer() {
        let cancel = CancellationToken::new();
        let (reader, _writer) = tokio::io::duplex(64);
        let mut gate = PromptConfirm::new(tokio::io::BufReader::new(reader), tokio::io::sink())
            .with_cancel(cancel.clone());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        assert!(!gate.confirm("Tear down?").await);
    }

    #[tokio::test]
    async fn test_assume_yes() {
        assert!(AssumeYes.confirm("Tear down?").await);
    }
}
