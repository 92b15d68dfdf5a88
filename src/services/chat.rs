use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{AppError, AppResult};
use crate::models::{ChatReply, ChatRequest, ChatTranscript, SharedResource};
use crate::services::backend::{AccessScope, ShareBackend};

/// Transcript plus the in-flight flag that serializes questions.
#[derive(Default)]
pub struct ChatSession {
    transcript: Mutex<ChatTranscript>,
    in_flight: AtomicBool,
}

impl ChatSession {
    fn transcript_mut(&self) -> MutexGuard<'_, ChatTranscript> {
        self.transcript.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn transcript(&self) -> ChatTranscript {
        self.transcript_mut().clone()
    }

    /// Clearing while a question is in flight would orphan its reply.
    pub fn clear(&self) -> AppResult<()> {
        let mut transcript = self.transcript_mut();
        if self.is_busy() {
            return Err(AppError::Conflict(
                "cannot clear the transcript while a question is in flight".to_string(),
            ));
        }
        transcript.clear();
        Ok(())
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Claim the session for one question and record the user turn.
    fn begin(&self, message: &str) -> AppResult<TurnGuard<'_>> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AppError::Conflict(
                "a question is already in flight".to_string(),
            ));
        }

        self.transcript_mut().push_user(message);
        Ok(TurnGuard {
            session: self,
            answered: false,
        })
    }
}

/// Guarantees exactly one assistant turn per user turn, even when the
/// request future is dropped mid-flight.
struct TurnGuard<'a> {
    session: &'a ChatSession,
    answered: bool,
}

impl TurnGuard<'_> {
    fn reply(mut self, reply: &ChatReply) {
        self.session.transcript_mut().push_reply(reply);
        self.answered = true;
    }

    fn fail(mut self, message: &str) {
        self.session.transcript_mut().push_error(message);
        self.answered = true;
    }
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        if !self.answered {
            self.session
                .transcript_mut()
                .push_error("request cancelled before a reply arrived");
        }
        self.session.in_flight.store(false, Ordering::SeqCst);
    }
}

/// Forwards questions about a shared resource to the inference backend.
#[derive(Clone)]
pub struct ChatRelay {
    backend: Arc<dyn ShareBackend>,
    max_message_chars: usize,
}

impl ChatRelay {
    pub fn new(backend: Arc<dyn ShareBackend>, max_message_chars: usize) -> Self {
        Self {
            backend,
            max_message_chars,
        }
    }

    fn validate(&self, message: &str) -> AppResult<()> {
        if message.is_empty() {
            return Err(AppError::Validation("message cannot be empty".to_string()));
        }
        if message.chars().count() > self.max_message_chars {
            return Err(AppError::Validation(format!(
                "message cannot exceed {} characters",
                self.max_message_chars
            )));
        }
        Ok(())
    }

    /// Ask one question. `primary_file` yields the file id that scopes
    /// multi-file resources; it runs only after the user turn is recorded,
    /// so its failure still leaves a user turn and an error turn.
    ///
    /// Nothing is relayed when chat is disabled for the resource.
    pub async fn ask<F>(
        &self,
        scope: &AccessScope,
        resource: &SharedResource,
        primary_file: F,
        session: &ChatSession,
        message: &str,
    ) -> AppResult<ChatReply>
    where
        F: Future<Output = AppResult<Option<String>>>,
    {
        if !resource.enable_chat {
            return Err(AppError::Forbidden(
                "chat is not enabled for this resource".to_string(),
            ));
        }

        let message = message.trim();
        self.validate(message)?;

        let turn = session.begin(message)?;
        let file_id = match primary_file.await {
            Ok(file_id) => file_id,
            Err(error) => {
                tracing::warn!(
                    "Chat for share {} could not resolve the primary file: {}",
                    scope.token.fingerprint(),
                    error
                );
                turn.fail(&error.to_string());
                return Err(error);
            }
        };
        let request = ChatRequest {
            message: message.to_string(),
            file_id,
        };

        match self.backend.chat(scope, &request).await {
            Ok(reply) => {
                tracing::debug!(
                    "Chat reply for share {} (model={:?}, tokens={:?})",
                    scope.token.fingerprint(),
                    reply.model,
                    reply.tokens_used
                );
                turn.reply(&reply);
                Ok(reply)
            }
            Err(e) => {
                tracing::warn!("Chat relay for share {} failed: {}", scope.token.fingerprint(), e);
                let error = AppError::from(e);
                turn.fail(&error.to_string());
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future::ready;

    use tokio_test::assert_ok;

    use super::*;
    use crate::models::{AccessTier, ChatRole, ShareToken};
    use crate::services::backend::BackendError;
    use crate::services::fake_backend::{resource, FakeBackend};

    fn scope() -> AccessScope {
        AccessScope::new(
            ShareToken::parse("abc123").unwrap(),
            AccessTier::Public,
            None,
            None,
        )
    }

    fn reply() -> ChatReply {
        ChatReply {
            reply: "There are 100 rows.".to_string(),
            model: Some("gpt-4o-mini".to_string()),
            tokens_used: Some(31),
        }
    }

    #[tokio::test]
    async fn successful_ask_appends_user_then_assistant() {
        let backend = Arc::new(FakeBackend::new().with_chat(Ok(reply())));
        let relay = ChatRelay::new(backend.clone(), 4000);
        let session = ChatSession::default();

        let answer = relay
            .ask(&scope(), &resource("sales", "mysql"), ready(Ok(None)), &session, "  how many rows? ")
            .await
            .unwrap();

        assert_eq!(answer.tokens_used, Some(31));
        let transcript = session.transcript();
        let turns = transcript.turns();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, ChatRole::User);
        assert_eq!(turns[0].text, "how many rows?");
        assert_eq!(turns[1].role, ChatRole::Assistant);
        assert_eq!(turns[1].model.as_deref(), Some("gpt-4o-mini"));
        assert!(!turns[1].is_error);
        assert!(!session.is_busy());
    }

    #[tokio::test]
    async fn failed_ask_appends_exactly_one_user_and_one_error_turn() {
        let backend = Arc::new(
            FakeBackend::new().with_chat(Err(BackendError::Upstream("model offline".to_string()))),
        );
        let relay = ChatRelay::new(backend.clone(), 4000);
        let session = ChatSession::default();

        let result = relay
            .ask(&scope(), &resource("sales", "mysql"), ready(Ok(None)), &session, "hello")
            .await;

        assert!(matches!(result, Err(AppError::Upstream(_))));
        let transcript = session.transcript();
        let turns = transcript.turns();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns.iter().filter(|t| t.role == ChatRole::User).count(), 1);
        assert!(turns[1].is_error);
        assert_eq!(turns[1].role, ChatRole::Assistant);
        assert_eq!(backend.chat_requests().len(), 1);
    }

    #[tokio::test]
    async fn disabled_chat_is_not_relayed() {
        let backend = Arc::new(FakeBackend::new().with_chat(Ok(reply())));
        let relay = ChatRelay::new(backend.clone(), 4000);
        let session = ChatSession::default();
        let mut resource = resource("sales", "mysql");
        resource.enable_chat = false;

        let result = relay
            .ask(&scope(), &resource, ready(Ok(None)), &session, "hello")
            .await;

        assert!(matches!(result, Err(AppError::Forbidden(_))));
        assert!(session.transcript().is_empty());
        assert!(backend.chat_requests().is_empty());
    }

    #[tokio::test]
    async fn invalid_messages_leave_transcript_untouched() {
        let relay = ChatRelay::new(Arc::new(FakeBackend::new().with_chat(Ok(reply()))), 5);
        let session = ChatSession::default();
        let resource = resource("sales", "mysql");

        for message in ["   ", "way too long"] {
            let result = relay
                .ask(&scope(), &resource, ready(Ok(None)), &session, message)
                .await;
            assert!(matches!(result, Err(AppError::Validation(_))));
        }
        assert!(session.transcript().is_empty());
    }

    #[test]
    fn second_question_while_in_flight_is_rejected() {
        let session = ChatSession::default();
        let first = session.begin("first").unwrap();

        assert!(matches!(session.begin("second"), Err(AppError::Conflict(_))));
        first.fail("boom");

        assert!(session.begin("third").is_ok());
        let transcript = session.transcript();
        // first + its error, third + the drop-time error
        assert_eq!(transcript.len(), 4);
        assert_eq!(
            transcript
                .turns()
                .iter()
                .filter(|t| t.role == ChatRole::User)
                .count(),
            2
        );
    }

    #[test]
    fn dropped_turn_still_gets_an_error_entry() {
        let session = ChatSession::default();
        drop(session.begin("question").unwrap());

        let transcript = session.transcript();
        assert_eq!(transcript.len(), 2);
        assert!(transcript.turns()[1].is_error);
        assert!(!session.is_busy());
    }

    #[test]
    fn clear_empties_transcript() {
        let session = ChatSession::default();
        session.begin("question").unwrap().reply(&reply());
        assert_eq!(session.transcript().len(), 2);
        assert_ok!(session.clear());
        assert!(session.transcript().is_empty());
    }

    #[test]
    fn clear_is_rejected_while_a_question_is_in_flight() {
        let session = ChatSession::default();
        let turn = session.begin("question").unwrap();

        assert!(matches!(session.clear(), Err(AppError::Conflict(_))));
        turn.reply(&reply());

        let transcript = session.transcript();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript.turns()[0].role, ChatRole::User);
        assert_eq!(transcript.turns()[1].role, ChatRole::Assistant);
        assert_ok!(session.clear());
    }

    #[tokio::test]
    async fn primary_file_failure_is_recorded_as_an_error_turn() {
        let backend = Arc::new(FakeBackend::new().with_chat(Ok(reply())));
        let relay = ChatRelay::new(backend.clone(), 4000);
        let session = ChatSession::default();

        let result = relay
            .ask(
                &scope(),
                &resource("sales", "mysql"),
                ready(Err(AppError::Upstream("listing down".to_string()))),
                &session,
                "which file?",
            )
            .await;

        assert!(matches!(result, Err(AppError::Upstream(_))));
        let transcript = session.transcript();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript.turns()[0].text, "which file?");
        assert!(transcript.turns()[1].is_error);
        assert!(backend.chat_requests().is_empty());
        assert!(!session.is_busy());
    }

    #[tokio::test]
    async fn primary_file_scopes_the_request() {
        let backend = Arc::new(FakeBackend::new().with_chat(Ok(reply())));
        let relay = ChatRelay::new(backend.clone(), 4000);
        let session = ChatSession::default();

        assert_ok!(
            relay
                .ask(
                    &scope(),
                    &resource("sales", "mysql"),
                    ready(Ok(Some("f2".to_string()))),
                    &session,
                    "hello",
                )
                .await
        );
        assert_eq!(backend.chat_requests()[0].file_id.as_deref(), Some("f2"));
    }
}
