use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use quorum_core::{AgentConfig, ModelRef, OrchestratorConfig, RunResult, Tokenizer};
use quorum_embeddings::{encode_blob, EmbeddingService};
use quorum_llm::Connector;
use quorum_store::{ConversationRepo, Database, NewConversation, SessionRepo};
use quorum_telemetry::ConversationLogger;

use crate::compress::{AgentClass, Compressor};
use crate::consensus::merge_consensus;
use crate::context::{ContextAggregator, ContextTelemetry};
use crate::critics::{select_critics, SelectedCritic};
use crate::error::ChainError;
use crate::refine::{check_convergence, refinement_prompt, IssueDetector};
use crate::session::{SessionManager, SessionSource};

/// Stage keyword that expands into critic fan-out + refinement.
const CRITICS_STAGE: &str = "critics";

fn default_stages() -> Vec<String> {
    vec!["builder".into(), CRITICS_STAGE.into(), "closer".into()]
}

/// Orchestrates one request end to end: context injection, builder, critic
/// fan-out, bounded refinement, closer, persistence. All collaborators are
/// process-lifetime services injected at construction.
#[derive(Clone)]
pub struct ChainRuntime {
    config: Arc<OrchestratorConfig>,
    connector: Arc<Connector>,
    conversations: Arc<ConversationRepo>,
    sessions: Arc<SessionManager>,
    aggregator: Arc<ContextAggregator>,
    compressor: Arc<Compressor>,
    embedder: Arc<dyn EmbeddingService>,
    tokenizer: Tokenizer,
    logger: Arc<ConversationLogger>,
}

impl ChainRuntime {
    pub fn new(
        config: Arc<OrchestratorConfig>,
        connector: Arc<Connector>,
        db: Database,
        embedder: Arc<dyn EmbeddingService>,
        logger: Arc<ConversationLogger>,
    ) -> Self {
        let tokenizer = Tokenizer::bpe();
        let conversations = Arc::new(ConversationRepo::new(db.clone()));
        let sessions = Arc::new(SessionManager::new(SessionRepo::new(db)));
        let aggregator = Arc::new(ContextAggregator::new(
            conversations.clone(),
            embedder.clone(),
            tokenizer,
        ));
        let compressor = Arc::new(Compressor::new(
            connector.clone(),
            config.compression.clone(),
            tokenizer,
        ));
        Self {
            config,
            connector,
            conversations,
            sessions,
            aggregator,
            compressor,
            embedder,
            tokenizer,
            logger,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn conversations(&self) -> &Arc<ConversationRepo> {
        &self.conversations
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Execute a single agent (the `/ask` surface).
    #[instrument(skip(self, prompt), fields(agent = agent_name))]
    pub async fn run(
        &self,
        agent_name: &str,
        prompt: &str,
        override_model: Option<&str>,
        session_id: Option<&str>,
        source: SessionSource,
    ) -> Result<RunResult, ChainError> {
        let agent = self.config.require_agent(agent_name)?.clone();
        if let Some(model) = override_model {
            ModelRef::parse(model)?;
        }
        let session = self.sessions.resolve(session_id, source, json!({}))?;
        self.execute_agent(&agent, agent_name, prompt, override_model, session.as_deref())
            .await
    }

    /// Execute a full chain with default stages builder → critics → closer.
    pub async fn chain(
        &self,
        prompt: &str,
        session_id: Option<&str>,
        source: SessionSource,
        stages: Option<Vec<String>>,
    ) -> Result<Vec<RunResult>, ChainError> {
        self.chain_with_cancel(prompt, session_id, source, stages, CancellationToken::new())
            .await
    }

    /// Chain execution with cooperative cancellation: in-flight critic calls
    /// are signalled, and no further stages start once cancelled.
    #[instrument(skip(self, prompt, stages, cancel))]
    pub async fn chain_with_cancel(
        &self,
        prompt: &str,
        session_id: Option<&str>,
        source: SessionSource,
        stages: Option<Vec<String>>,
        cancel: CancellationToken,
    ) -> Result<Vec<RunResult>, ChainError> {
        let stage_names = stages.unwrap_or_else(default_stages);

        // Unknown stage names fail before any model call.
        for stage in &stage_names {
            if stage != CRITICS_STAGE {
                self.config.require_agent(stage)?;
            }
        }

        let session = self.sessions.resolve(session_id, source, json!({}))?;
        let mut results: Vec<RunResult> = Vec::new();

        for (idx, stage) in stage_names.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(ChainError::Cancelled);
            }

            if stage == CRITICS_STAGE {
                self.critic_phase(
                    prompt,
                    stage_names.first().map(String::as_str),
                    session.as_deref(),
                    &cancel,
                    &mut results,
                )
                .await?;
                continue;
            }

            let agent = self.config.require_agent(stage)?.clone();
            let input = if idx == 0 {
                prompt.to_string()
            } else {
                self.compose_stage_input(prompt, &results).await
            };
            let result = self
                .execute_agent(&agent, stage, &input, None, session.as_deref())
                .await?;
            results.push(result);
        }

        Ok(results)
    }

    /// Critic fan-out, consensus, and the bounded refinement loop.
    async fn critic_phase(
        &self,
        prompt: &str,
        builder_stage: Option<&str>,
        session: Option<&str>,
        cancel: &CancellationToken,
        results: &mut Vec<RunResult>,
    ) -> Result<(), ChainError> {
        let critics_cfg = &self.config.critics;
        if critics_cfg.members.is_empty() {
            warn!("no critics configured; skipping critic stage");
            return Ok(());
        }

        let builder_output = results
            .last()
            .map(|r| r.response.clone())
            .unwrap_or_default();

        let selected = select_critics(prompt, &builder_output, critics_cfg);
        if selected.is_empty() {
            warn!("critic selection came back empty; skipping critic stage");
            return Ok(());
        }

        let critic_input = self.compose_critic_input(prompt, &builder_output).await;
        let reviews = self
            .run_critics(&selected, &critic_input, session, cancel)
            .await?;
        let consensus = merge_consensus(
            "multi-critic",
            &critic_input,
            &reviews,
            self.tokenizer,
            session,
        );
        results.push(consensus);

        if !self.config.refinement.enabled {
            return Ok(());
        }
        let Some(builder_stage) = builder_stage.filter(|s| *s != CRITICS_STAGE) else {
            return Ok(());
        };
        let builder_cfg = self.config.require_agent(builder_stage)?.clone();
        let detector = IssueDetector::new(&self.config.refinement)?;

        let mut latest_review = results
            .last()
            .map(|r| r.response.clone())
            .unwrap_or_default();
        let mut previous_issues = detector.count(&latest_review);
        if previous_issues == 0 {
            info!("initial review raised no critical issues; refinement not needed");
            return Ok(());
        }

        let max_iterations = self.config.refinement.max_iterations;
        for iteration in 1..=max_iterations {
            if cancel.is_cancelled() {
                return Err(ChainError::Cancelled);
            }
            let version = iteration + 1;

            let issues = detector.extract(&latest_review);
            let refine_input = refinement_prompt(prompt, &issues);
            let revised = self
                .execute_agent(
                    &builder_cfg,
                    &format!("{builder_stage}-v{version}"),
                    &refine_input,
                    None,
                    session,
                )
                .await?;
            let revised_output = revised.response.clone();
            results.push(revised);

            let selection = if critics_cfg.reselect_each_iteration {
                let reselected = select_critics(prompt, &revised_output, critics_cfg);
                if reselected.is_empty() {
                    selected.clone()
                } else {
                    reselected
                }
            } else {
                selected.clone()
            };

            let iter_input = self.compose_critic_input(prompt, &revised_output).await;
            let reviews = self
                .run_critics(&selection, &iter_input, session, cancel)
                .await?;
            let consensus = merge_consensus(
                &format!("multi-critic-v{version}"),
                &iter_input,
                &reviews,
                self.tokenizer,
                session,
            );
            latest_review = consensus.response.clone();
            let current_issues = detector.count(&latest_review);
            results.push(consensus);

            if let Some(reason) = check_convergence(
                previous_issues,
                current_issues,
                iteration,
                max_iterations,
            ) {
                info!(
                    reason = reason.as_str(),
                    iteration,
                    previous_issues,
                    current_issues,
                    "refinement converged"
                );
                return Ok(());
            }
            previous_issues = current_issues;
        }
        Ok(())
    }

    /// Run the selected critics in parallel, one task per critic, each with
    /// its own retry/fallback. Results are collected in selection order for
    /// deterministic consensus formatting; failed critics are dropped as
    /// long as at least one succeeded.
    async fn run_critics(
        &self,
        selected: &[SelectedCritic],
        critic_input: &str,
        session: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<(SelectedCritic, RunResult)>, ChainError> {
        let mut handles = Vec::with_capacity(selected.len());
        for critic in selected {
            let agent = self.config.require_agent(&critic.name)?.clone();
            let runtime = self.clone();
            let input = critic_input.to_string();
            let session = session.map(str::to_string);
            let stage = critic.name.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => Err(ChainError::Cancelled),
                    result = runtime.execute_agent(&agent, &stage, &input, None, session.as_deref()) => result,
                }
            }));
        }

        let mut reviews = Vec::with_capacity(selected.len());
        for (critic, handle) in selected.iter().zip(handles) {
            match handle.await {
                Ok(Ok(result)) => reviews.push((critic.clone(), result)),
                Ok(Err(e)) => {
                    warn!(critic = %critic.name, error = %e, "critic failed; dropping its contribution");
                }
                Err(e) => {
                    warn!(critic = %critic.name, error = %e, "critic task panicked; dropping its contribution");
                }
            }
        }

        if reviews.is_empty() {
            if cancel.is_cancelled() {
                return Err(ChainError::Cancelled);
            }
            return Err(ChainError::AllCriticsFailed);
        }
        Ok(reviews)
    }

    async fn compose_critic_input(&self, prompt: &str, builder_output: &str) -> String {
        let compressed = self
            .compressor
            .compress_if_needed(builder_output, AgentClass::Standard)
            .await;
        format!(
            "Original request: {prompt}\n\nBuilder output:\n{compressed}\n\n\
             Review this work and raise any critical issues."
        )
    }

    /// Input for stages after the critic phase: the original prompt plus
    /// every preserved stage output, compressed and labeled.
    async fn compose_stage_input(&self, prompt: &str, results: &[RunResult]) -> String {
        let mut parts = vec![format!("Original request: {prompt}")];
        for result in results {
            let compressed = self
                .compressor
                .compress_if_needed(&result.response, AgentClass::Closer)
                .await;
            parts.push(format!("[{}]\n{compressed}", result.agent));
        }
        parts.join("\n\n")
    }

    /// One agent call: context injection, LLM call, persistence, log file.
    async fn execute_agent(
        &self,
        agent: &AgentConfig,
        stage: &str,
        user_prompt: &str,
        override_model: Option<&str>,
        session: Option<&str>,
    ) -> Result<RunResult, ChainError> {
        let (context, telemetry) = if agent.memory_enabled {
            self.aggregator
                .aggregate(user_prompt, session, &agent.name, &agent.memory)
                .await
        } else {
            (String::new(), ContextTelemetry::default())
        };

        let system = if context.is_empty() {
            agent.system_prompt.clone()
        } else {
            format!("{}\n\n{context}", agent.system_prompt)
        };

        let (model, fallbacks): (&str, &[String]) = match override_model {
            // An explicit override suppresses the configured rotation.
            Some(model) => (model, &[]),
            None => (agent.model.as_str(), &agent.fallback_models),
        };

        let response = self
            .connector
            .call(
                model,
                &system,
                user_prompt,
                agent.temperature,
                agent.max_tokens,
                fallbacks,
            )
            .await
            .map_err(|e| ChainError::StageFailed {
                stage: stage.to_string(),
                source: e,
            })?;

        let timestamp = Utc::now().to_rfc3339();
        let mut result = RunResult {
            agent: stage.to_string(),
            model: response.model.clone(),
            provider: response.provider.clone(),
            prompt: user_prompt.to_string(),
            response: response.text.clone(),
            prompt_tokens: response.prompt_tokens,
            completion_tokens: response.completion_tokens,
            total_tokens: response.total_tokens,
            duration_ms: response.duration_ms,
            estimated_cost_usd: response.estimated_cost_usd,
            fallback_used: response.fallback_used(),
            original_model: response.original_model.clone(),
            fallback_reason: response.fallback_reason.clone(),
            injected_context_tokens: telemetry.total_tokens,
            session_context_tokens: telemetry.session_tokens,
            knowledge_context_tokens: telemetry.knowledge_tokens,
            session_id: session.map(str::to_string),
            timestamp: timestamp.clone(),
            log_file: None,
        };

        // Embedding is best-effort: a failure only disables semantic
        // retrieval for this record.
        let embedding = match self.embedder.embed(user_prompt).await {
            Ok(v) => Some(encode_blob(&v)),
            Err(e) => {
                warn!(stage, error = %e, "embedding generation failed; storing record without one");
                None
            }
        };

        self.conversations.insert(&NewConversation {
            timestamp: Some(timestamp.clone()),
            agent: stage.to_string(),
            model: result.model.clone(),
            provider: result.provider.clone(),
            prompt: user_prompt.to_string(),
            response: result.response.clone(),
            prompt_tokens: result.prompt_tokens,
            completion_tokens: result.completion_tokens,
            total_tokens: result.total_tokens,
            duration_ms: result.duration_ms,
            estimated_cost_usd: result.estimated_cost_usd,
            fallback_used: result.fallback_used,
            original_model: result.original_model.clone(),
            fallback_reason: result.fallback_reason.clone(),
            session_id: result.session_id.clone(),
            embedding,
        })?;

        if let Some(sid) = session {
            self.sessions.touch(sid);
        }

        let log_record = json!({
            "agent": stage,
            "model": result.model,
            "provider": result.provider,
            "prompt": user_prompt,
            "response": result.response,
            "prompt_tokens": result.prompt_tokens,
            "completion_tokens": result.completion_tokens,
            "total_tokens": result.total_tokens,
            "duration_ms": result.duration_ms,
            "estimated_cost_usd": result.estimated_cost_usd,
            "fallback_used": result.fallback_used,
            "original_model": result.original_model,
            "fallback_reason": result.fallback_reason,
            "session_id": result.session_id,
            "injected_context_tokens": result.injected_context_tokens,
            "timestamp": timestamp,
        });
        match self.logger.write(&log_record) {
            Ok(filename) => result.log_file = Some(filename),
            Err(e) => warn!(stage, error = %e, "conversation log write failed"),
        }

        Ok(result)
    }
}
