//! ============================================================================
//! Chat Service - Orchestrates one memory-augmented turn
//! ============================================================================

use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::prompt::build_messages;
use super::{ChatModel, TokenStream};
use crate::db::{blocking, Conversation, HistoryStore, Message};
use crate::dispatcher::{Dispatcher, RememberJob};
use crate::error::{MemchatError, Result};
use crate::memory::{
    filter_relevant, namespace_for, MemoryManager, Role, DEFAULT_RELEVANCE_THRESHOLD,
    DEFAULT_TOP_K,
};

/// Appended to the stream when the model fails mid-answer
pub const APOLOGY: &str = "Sorry, an error occurred while streaming the response.";

/// Tuning for prompt assembly
#[derive(Debug, Clone, Copy)]
pub struct ChatSettings {
    pub recall_top_k: u64,
    pub relevance_threshold: f32,
    /// Prior messages of the conversation included in the prompt
    pub history_turns: usize,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            recall_top_k: DEFAULT_TOP_K,
            relevance_threshold: DEFAULT_RELEVANCE_THRESHOLD,
            history_turns: 10,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub user_input: String,
    pub conversation_id: Option<u64>,
    pub user_id: Option<String>,
}

/// A running turn: the conversation it belongs to and its token feed
pub struct ChatTurn {
    pub conversation_id: u64,
    pub tokens: mpsc::Receiver<String>,
}

pub struct ChatService {
    history: Arc<HistoryStore>,
    memory: Option<Arc<MemoryManager>>,
    dispatcher: Dispatcher,
    model: Arc<dyn ChatModel>,
    settings: ChatSettings,
}

impl ChatService {
    pub fn new(
        history: Arc<HistoryStore>,
        memory: Option<Arc<MemoryManager>>,
        dispatcher: Dispatcher,
        model: Arc<dyn ChatModel>,
        settings: ChatSettings,
    ) -> Self {
        Self {
            history,
            memory,
            dispatcher,
            model,
            settings,
        }
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    pub fn memory(&self) -> Option<&Arc<MemoryManager>> {
        self.memory.as_ref()
    }

    /// Start a turn and return as soon as the model stream is being relayed.
    ///
    /// Fails only for empty input or an unknown conversation id; every memory
    /// and model failure degrades inside the stream instead.
    pub async fn start_turn(&self, request: TurnRequest) -> Result<ChatTurn> {
        let user_text = request.user_input.trim().to_string();
        if user_text.is_empty() {
            return Err(MemchatError::EmptyInput);
        }

        let user_id = namespace_for(request.user_id.as_deref());
        let conversation = self
            .resolve_conversation(request.conversation_id, &user_id)
            .await?;
        let conversation_id = conversation.id;

        // Read before enqueueing so the new message is never its own prior turn
        let prior = self.prior_turns(conversation_id);

        self.submit(&user_text, &user_id, Role::User, conversation_id)
            .await;

        let context = match &self.memory {
            Some(memory) => {
                let recalled = memory
                    .recall(&user_text, Some(&user_id), self.settings.recall_top_k)
                    .await;
                let relevant = filter_relevant(&recalled, self.settings.relevance_threshold);
                debug!("Found {} relevant memories", relevant.len());
                relevant
            }
            None => vec![],
        };

        let messages = build_messages(&context, &prior, &user_text);
        let (tx, rx) = mpsc::channel(64);

        let model = Arc::clone(&self.model);
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            let stream = model.stream(messages).await;
            let answer = relay(stream, &tx).await;

            let answer = answer.trim();
            if answer.is_empty() {
                debug!("No answer text to remember for conversation {}", conversation_id);
                return;
            }
            let job = RememberJob {
                text: answer.to_string(),
                user_id: Some(user_id),
                role: Role::Assistant,
                conversation_id,
            };
            if let Err(e) = dispatcher.submit(job).await {
                error!("Failed to enqueue assistant answer: {}", e);
            }
        });

        info!("Started turn in conversation {}", conversation_id);
        Ok(ChatTurn {
            conversation_id,
            tokens: rx,
        })
    }

    async fn resolve_conversation(&self, id: Option<u64>, user_id: &str) -> Result<Conversation> {
        let history = Arc::clone(&self.history);
        let user_id = user_id.to_string();
        blocking(move || match id {
            Some(id) => history
                .get_conversation(id)?
                .ok_or_else(|| MemchatError::NotFound(format!("Conversation {}", id))),
            None => history.create_conversation(&user_id),
        })
        .await
    }

    fn prior_turns(&self, conversation_id: u64) -> Vec<Message> {
        if self.settings.history_turns == 0 {
            return vec![];
        }
        self.history
            .recent_messages(conversation_id, self.settings.history_turns)
            .unwrap_or_else(|e| {
                warn!("Could not load prior turns: {}", e);
                vec![]
            })
    }

    async fn submit(&self, text: &str, user_id: &str, role: Role, conversation_id: u64) {
        let job = RememberJob {
            text: text.to_string(),
            user_id: Some(user_id.to_string()),
            role,
            conversation_id,
        };
        if let Err(e) = self.dispatcher.submit(job).await {
            error!("Failed to enqueue {} message: {}", role, e);
        }
    }
}

/// Forward tokens in order and return everything forwarded.
///
/// A model error sends the apology and ends the turn. A closed receiver stops
/// the relay; the text accumulated so far is still returned.
async fn relay(stream: Result<TokenStream>, tx: &mpsc::Sender<String>) -> String {
    let mut answer = String::new();

    let mut stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            error!("Chat stream failed to start: {}", e);
            let _ = tx.send(APOLOGY.to_string()).await;
            return answer;
        }
    };

    while let Some(item) = stream.next().await {
        match item {
            Ok(token) => {
                answer.push_str(&token);
                if tx.send(token).await.is_err() {
                    warn!("Client disconnected; keeping partial answer");
                    break;
                }
            }
            Err(e) => {
                error!("Chat stream failed: {}", e);
                let _ = tx.send(APOLOGY.to_string()).await;
                break;
            }
        }
    }

    answer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ChatMessage;
    use crate::dispatcher::{JobQueue, JobState, RememberWorker, WorkerPool};
    use crate::memory::{HashingEmbedder, IndexSpec, InMemoryIndex, Metric};
    use async_trait::async_trait;
    use futures_util::stream;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const DIM: usize = 64;

    /// Replays a fixed script and records the prompts it was given
    struct ScriptedModel {
        script: Vec<Result<String>>,
        prompts: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedModel {
        fn new(script: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                script,
                prompts: Mutex::new(vec![]),
            })
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        fn model(&self) -> &str {
            "scripted"
        }

        async fn stream(&self, messages: Vec<ChatMessage>) -> Result<TokenStream> {
            self.prompts.lock().unwrap().push(messages);
            Ok(stream::iter(self.script.clone()).boxed())
        }
    }

    struct Fixture {
        service: ChatService,
        queue: Arc<JobQueue>,
        history: Arc<HistoryStore>,
        memory: Arc<MemoryManager>,
        _rx: mpsc::UnboundedReceiver<crate::dispatcher::JobId>,
        _dir: TempDir,
    }

    async fn fixture(model: Arc<dyn ChatModel>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let history = Arc::new(HistoryStore::open(Some(&dir.path().join("history.redb"))).unwrap());
        let queue = Arc::new(JobQueue::open(&dir.path().join("broker.redb")).unwrap());
        let index = Arc::new(InMemoryIndex::new(IndexSpec::new("test", DIM, Metric::Cosine)));
        let memory = Arc::new(
            MemoryManager::new(index, Arc::new(HashingEmbedder::new(DIM)))
                .await
                .unwrap(),
        );
        // No workers: jobs stay enqueued so tests can inspect them
        let (dispatcher, rx) = Dispatcher::new(queue.clone());

        let service = ChatService::new(
            history.clone(),
            Some(memory.clone()),
            dispatcher,
            model,
            ChatSettings::default(),
        );
        Fixture {
            service,
            queue,
            history,
            memory,
            _rx: rx,
            _dir: dir,
        }
    }

    async fn drain(mut turn: ChatTurn) -> String {
        let mut body = String::new();
        while let Some(token) = turn.tokens.recv().await {
            body.push_str(&token);
        }
        body
    }

    async fn wait_for_jobs(queue: &JobQueue, count: usize) -> Vec<RememberJob> {
        for _ in 0..100 {
            let jobs = queue.list(None).unwrap();
            if jobs.len() >= count {
                return jobs.into_iter().map(|r| r.job).collect();
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("expected {} jobs", count);
    }

    fn tokens(parts: &[&str]) -> Vec<Result<String>> {
        parts.iter().map(|p| Ok(p.to_string())).collect()
    }

    #[tokio::test]
    async fn test_turn_streams_and_enqueues_both_sides() {
        let f = fixture(ScriptedModel::new(tokens(&["Gradient ", "descent ", "minimises loss."]))).await;

        let turn = f
            .service
            .start_turn(TurnRequest {
                user_input: "  Explain gradient descent  ".to_string(),
                conversation_id: None,
                user_id: Some("u1".to_string()),
            })
            .await
            .unwrap();
        let conversation_id = turn.conversation_id;
        assert_eq!(drain(turn).await, "Gradient descent minimises loss.");

        let jobs = wait_for_jobs(&f.queue, 2).await;
        assert_eq!(jobs[0].text, "Explain gradient descent");
        assert_eq!(jobs[0].role, Role::User);
        assert_eq!(jobs[1].text, "Gradient descent minimises loss.");
        assert_eq!(jobs[1].role, Role::Assistant);
        assert!(jobs.iter().all(|j| j.conversation_id == conversation_id));
        assert!(jobs.iter().all(|j| j.user_id.as_deref() == Some("u1")));
    }

    #[tokio::test]
    async fn test_empty_input_rejected() {
        let f = fixture(ScriptedModel::new(tokens(&["x"]))).await;
        let result = f
            .service
            .start_turn(TurnRequest {
                user_input: "   ".to_string(),
                ..Default::default()
            })
            .await;
        assert!(matches!(result, Err(MemchatError::EmptyInput)));
        assert!(f.queue.list(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_conversation_is_not_found() {
        let f = fixture(ScriptedModel::new(tokens(&["x"]))).await;
        let result = f
            .service
            .start_turn(TurnRequest {
                user_input: "hello".to_string(),
                conversation_id: Some(424242),
                user_id: None,
            })
            .await;
        assert!(matches!(result, Err(MemchatError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_missing_user_id_defaults_to_guest() {
        let f = fixture(ScriptedModel::new(tokens(&["ok"]))).await;
        let turn = f
            .service
            .start_turn(TurnRequest {
                user_input: "hello".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let convo = f.history.get_conversation(turn.conversation_id).unwrap().unwrap();
        assert_eq!(convo.user_id, "guest_session");
        drain(turn).await;

        let jobs = wait_for_jobs(&f.queue, 2).await;
        assert_eq!(jobs[0].user_id.as_deref(), Some("guest_session"));
    }

    #[tokio::test]
    async fn test_model_error_appends_apology_and_keeps_partial() {
        let script = vec![
            Ok("Partial ".to_string()),
            Err(MemchatError::Generation("upstream reset".into())),
            Ok("never sent".to_string()),
        ];
        let f = fixture(ScriptedModel::new(script)).await;

        let turn = f
            .service
            .start_turn(TurnRequest {
                user_input: "hello".to_string(),
                user_id: Some("u1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(drain(turn).await, format!("Partial {}", APOLOGY));

        let jobs = wait_for_jobs(&f.queue, 2).await;
        assert_eq!(jobs[1].text, "Partial");
    }

    #[tokio::test]
    async fn test_disconnect_still_saves_partial_answer() {
        let f = fixture(ScriptedModel::new(tokens(&["first ", "second ", "third"]))).await;

        let mut turn = f
            .service
            .start_turn(TurnRequest {
                user_input: "hello".to_string(),
                user_id: Some("u1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(turn.tokens.recv().await.as_deref(), Some("first "));
        drop(turn);

        let jobs = wait_for_jobs(&f.queue, 2).await;
        assert_eq!(jobs[1].role, Role::Assistant);
        assert!(jobs[1].text.starts_with("first"));
    }

    #[tokio::test]
    async fn test_relevant_memories_reach_the_prompt() {
        let model = ScriptedModel::new(tokens(&["ok"]));
        let f = fixture(model.clone()).await;
        f.memory
            .remember("my cluster runs kubernetes on gke", Some("u1"), Role::User)
            .await
            .unwrap();
        f.memory
            .remember("favourite pizza topping is basil", Some("u1"), Role::User)
            .await
            .unwrap();

        let turn = f
            .service
            .start_turn(TurnRequest {
                user_input: "my cluster runs kubernetes on gke".to_string(),
                user_id: Some("u1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        drain(turn).await;

        let prompts = model.prompts.lock().unwrap();
        let context = &prompts[0][1];
        assert_eq!(context.role, "system");
        assert!(context.content.starts_with("Relevant memory context:"));
        assert!(context.content.contains("kubernetes on gke"));
        assert!(!context.content.contains("pizza"));
    }

    #[tokio::test]
    async fn test_full_pipeline_sets_title() {
        let f = fixture(ScriptedModel::new(tokens(&["Sure."]))).await;

        let (dispatcher, rx) = Dispatcher::new(f.queue.clone());
        let worker = Arc::new(RememberWorker::new(f.history.clone(), Some(f.memory.clone())));
        let pool = WorkerPool::start(f.queue.clone(), rx, worker, 1).unwrap();
        let service = ChatService::new(
            f.history.clone(),
            Some(f.memory.clone()),
            dispatcher.clone(),
            ScriptedModel::new(tokens(&["Sure."])),
            ChatSettings::default(),
        );

        let turn = service
            .start_turn(TurnRequest {
                user_input: "Explain gradient descent".to_string(),
                user_id: Some("u1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let conversation_id = turn.conversation_id;
        drain(turn).await;
        wait_for_jobs(&f.queue, 2).await;

        dispatcher.close();
        pool.join().await;

        assert!(f
            .queue
            .list(None)
            .unwrap()
            .iter()
            .all(|r| r.state == JobState::Completed));
        let convo = f.history.get_conversation(conversation_id).unwrap().unwrap();
        assert_eq!(convo.title, "Explain gradient descent");
        assert_eq!(f.history.get_history(conversation_id).unwrap().len(), 2);
    }
}
