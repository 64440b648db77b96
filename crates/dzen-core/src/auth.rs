//! Interactive login: console prompts and the bounded restart loop.

use std::io::{BufRead, Write};

use async_trait::async_trait;

use crate::{
    chat::port::{ChatClient, CredentialPrompt},
    errors::{AuthError, Error},
    Result,
};

pub const MAX_LOGIN_ATTEMPTS: usize = 3;

/// Reads answers from stdin on the blocking pool; secrets are read with echo off.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConsolePrompt;

fn prompt_line(message: &str) -> std::io::Result<String> {
    print!("{message}");
    std::io::stdout().flush()?;

    let mut input = String::new();
    let read = std::io::stdin().lock().read_line(&mut input)?;
    if read == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "stdin closed",
        ));
    }
    Ok(input.trim().to_string())
}

fn prompt_hidden(message: &str) -> std::io::Result<String> {
    rpassword::prompt_password(message).map(|s| s.trim().to_string())
}

async fn on_blocking_pool(
    question: &str,
    read: fn(&str) -> std::io::Result<String>,
) -> Result<String> {
    let question = question.to_string();
    tokio::task::spawn_blocking(move || read(&question))
        .await
        .map_err(|e| Error::External(format!("prompt task failed: {e}")))?
        .map_err(Error::from)
}

#[async_trait]
impl CredentialPrompt for ConsolePrompt {
    async fn ask(&self, question: &str) -> Result<String> {
        on_blocking_pool(question, prompt_line).await
    }

    async fn ask_secret(&self, question: &str) -> Result<String> {
        on_blocking_pool(question, prompt_hidden).await
    }
}

/// Authorize `chat`, restarting the login when the platform asks for it.
pub async fn establish_session(chat: &dyn ChatClient, prompt: &dyn CredentialPrompt) -> Result<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match chat.connect(prompt).await {
            Ok(()) => {
                tracing::info!("chat session authorized");
                return Ok(());
            }
            Err(err) if err.is_recoverable() && attempt < MAX_LOGIN_ATTEMPTS => {
                tracing::warn!(attempt, error = %err, "login restart requested, prompting again");
            }
            Err(err) => {
                tracing::error!(attempt, error = %err, "login failed");
                return Err(err.into());
            }
        }
    }
}

/// Maps a prompt failure into the login error it aborts.
pub fn aborted(error: Error) -> AuthError {
    AuthError::Aborted(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeChat, FakePrompt};

    #[tokio::test]
    async fn authorized_session_does_not_prompt() {
        let chat = FakeChat::default();
        let prompt = FakePrompt::default();
        establish_session(&chat, &prompt).await.unwrap();
        assert_eq!(chat.connect_calls(), 1);
        assert!(prompt.asked().is_empty());
    }

    #[tokio::test]
    async fn restart_is_retried_with_a_fresh_prompt() {
        let chat = FakeChat::default();
        chat.script_auth(vec![Err(AuthError::RestartRequired), Ok(())]);
        let prompt = FakePrompt::answering(&["11111", "22222"]);

        establish_session(&chat, &prompt).await.unwrap();
        assert_eq!(chat.connect_calls(), 2);
        assert_eq!(prompt.asked().len(), 2);
    }

    #[tokio::test]
    async fn restarts_are_bounded() {
        let chat = FakeChat::default();
        chat.script_auth(vec![Err(AuthError::RestartRequired); MAX_LOGIN_ATTEMPTS + 1]);
        let prompt = FakePrompt::answering(&["1", "2", "3", "4"]);

        let err = establish_session(&chat, &prompt).await.unwrap_err();
        assert!(matches!(err, Error::Auth(AuthError::RestartRequired)));
        assert_eq!(chat.connect_calls(), MAX_LOGIN_ATTEMPTS);
    }

    #[tokio::test]
    async fn other_auth_errors_abort_immediately() {
        let chat = FakeChat::default();
        chat.script_auth(vec![
            Err(AuthError::InvalidCredentials("PHONE_CODE_INVALID".to_string())),
            Ok(()),
        ]);
        let prompt = FakePrompt::answering(&["00000", "12345"]);

        let err = establish_session(&chat, &prompt).await.unwrap_err();
        assert!(matches!(err, Error::Auth(AuthError::InvalidCredentials(_))));
        assert_eq!(chat.connect_calls(), 1);
    }

    #[tokio::test]
    async fn unanswered_prompt_aborts_login() {
        let chat = FakeChat::default();
        chat.script_auth(vec![Ok(())]);

        let err = establish_session(&chat, &FakePrompt::default()).await.unwrap_err();
        assert!(matches!(err, Error::Auth(AuthError::Aborted(_))));
    }

    #[tokio::test]
    async fn two_factor_password_is_read_without_echo() {
        let chat = FakeChat::default();
        chat.script_auth(vec![Ok(())]);
        chat.require_two_factor();
        let prompt = FakePrompt::answering(&["12345", "hunter2"]);

        establish_session(&chat, &prompt).await.unwrap();
        assert_eq!(prompt.asked(), vec!["Enter the code you received: ".to_string()]);
        assert_eq!(prompt.asked_secret(), vec!["Enter your 2FA password: ".to_string()]);
    }

    #[tokio::test]
    async fn secret_questions_fall_back_to_plain_prompts() {
        struct Plain;

        #[async_trait]
        impl CredentialPrompt for Plain {
            async fn ask(&self, question: &str) -> Result<String> {
                Ok(format!("answer to {question}"))
            }
        }

        assert_eq!(Plain.ask_secret("pw? ").await.unwrap(), "answer to pw? ");
    }

    #[test]
    fn prompt_failure_becomes_aborted() {
        let e = aborted(Error::External("no scripted answer".to_string()));
        assert_eq!(e, AuthError::Aborted("external error: no scripted answer".to_string()));
        assert!(!e.is_recoverable());
    }
}
