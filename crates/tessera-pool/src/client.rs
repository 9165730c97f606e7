//! A single engine client: one sandbox, one engine handle.
//!
//! The guest engine is single-threaded and stateful. [`EngineClient`] takes
//! `&mut self` for every operation, so it can only be driven by one task at
//! a time; the pool gives each worker its own client.
//!
//! Every guest-allocated region is released before an operation returns,
//! on success and on every error path.

use std::time::Instant;

use tracing::{debug, info, instrument, warn};

use tessera_common::{ModelConfig, RuntimeError, SandboxConfig};
use tessera_core::memory::{self, InputSource};
use tessera_core::store::{LogEntry, OutputRedirection, create_store};
use tessera_core::{
    ExtractOptions, LoadOptions, OutputKind, ProgressCallback, Sandbox, SandboxRunner,
};

/// Lifecycle of an [`EngineClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// The sandbox exists but no model is loaded yet.
    Uninitialized,
    /// Idle and ready for the next input.
    Ready,
    /// An operation is in progress.
    Busy,
    /// Terminal: closed by the owner or after a trap.
    Closed,
}

/// Everything needed to bring a client up.
#[derive(Debug, Default)]
pub struct ClientConfig {
    /// Trained model data. Required.
    pub model: Option<InputSource>,

    /// Language and variables.
    pub model_config: ModelConfig,

    /// Memory limit and output modes.
    pub sandbox: SandboxConfig,

    /// Guest stdout and stderr destinations.
    pub output: OutputRedirection,
}

/// One guest engine instance with a loaded model.
pub struct EngineClient {
    id: String,
    sandbox: Option<Sandbox>,
    handle: i32,
    state: ClientState,
}

impl EngineClient {
    /// Instantiate a sandbox and load the trained model into a new engine.
    ///
    /// # Errors
    ///
    /// - `InvalidConfig` if the model is missing or empty; nothing is
    ///   instantiated in that case
    /// - `Engine` if the guest rejects the model or a variable
    /// - any instantiation or memory bridge error
    ///
    /// A partially initialized client is closed before the error is returned.
    #[instrument(skip(runner, id, config), fields(client_id))]
    pub async fn initialize(
        runner: &SandboxRunner,
        id: impl Into<String>,
        mut config: ClientConfig,
    ) -> Result<Self, RuntimeError> {
        let id = id.into();
        tracing::Span::current().record("client_id", id.as_str());
        let start = Instant::now();

        let Some(mut model) = config.model.take() else {
            return Err(RuntimeError::invalid_config("a trained model is required"));
        };
        let model_len = memory::size_of(&mut model).map_err(|e| match e {
            RuntimeError::EmptyInput => RuntimeError::invalid_config("the trained model is empty"),
            other => other,
        })?;

        let store = create_store(
            runner.module().engine(),
            &config.sandbox,
            &config.output,
            id.clone(),
        )?;
        let sandbox = runner.instantiate(store).await?;

        let mut client = Self {
            id,
            sandbox: Some(sandbox),
            handle: 0,
            state: ClientState::Uninitialized,
        };

        if let Err(e) = client.load_model(&mut model, &config.model_config).await {
            if let Err(close_err) = client.close().await {
                warn!(error = %close_err, "Failed to close half-initialized client");
            }
            return Err(e);
        }

        client.state = ClientState::Ready;
        info!(
            bytes_len = model_len,
            language = config.model_config.language_or_default(),
            duration_ms = start.elapsed().as_millis(),
            "Engine client ready"
        );
        Ok(client)
    }

    async fn load_model(
        &mut self,
        model: &mut InputSource,
        config: &ModelConfig,
    ) -> Result<(), RuntimeError> {
        let handle = self
            .sandbox()?
            .call("engine_new", |e| &e.engine_new, ())
            .await?;
        if handle == 0 {
            return Err(RuntimeError::engine(
                "engine_new",
                "engine construction failed",
            ));
        }
        self.handle = handle;

        let sb = self.sandbox()?;
        let model_region = memory::marshal(sb, model).await?;
        let language = match memory::marshal_str(sb, config.language_or_default()).await {
            Ok(region) => region,
            Err(e) => {
                memory::free(sb, model_region).await?;
                return Err(e);
            }
        };

        let result = sb
            .call(
                "engine_load_model",
                |e| &e.engine_load_model,
                (
                    handle,
                    model_region.ptr_arg(),
                    model_region.len_arg(),
                    language.ptr_arg(),
                ),
            )
            .await;
        let freed = free_both(sb, model_region, language).await;
        check(sb, "engine_load_model", result?).await?;
        freed?;

        for (key, value) in config.variables_or_default() {
            self.set_variable(&key, &value).await?;
        }

        Ok(())
    }

    async fn set_variable(&mut self, key: &str, value: &str) -> Result<(), RuntimeError> {
        let handle = self.handle;
        let sb = self.sandbox()?;

        let key_region = memory::marshal_str(sb, key).await?;
        let value_region = match memory::marshal_str(sb, value).await {
            Ok(region) => region,
            Err(e) => {
                memory::free(sb, key_region).await?;
                return Err(e);
            }
        };

        let result = sb
            .call(
                "engine_set_variable",
                |e| &e.engine_set_variable,
                (handle, key_region.ptr_arg(), value_region.ptr_arg()),
            )
            .await;
        let freed = free_both(sb, key_region, value_region).await;
        check(sb, "engine_set_variable", result?)
            .await
            .map_err(|e| match e {
                RuntimeError::Engine { message, .. } => {
                    RuntimeError::engine(format!("engine_set_variable({key})"), message)
                }
                other => other,
            })?;
        freed?;

        debug!(key, value, "Engine variable set");
        Ok(())
    }

    /// Replace the engine's current input.
    ///
    /// # Errors
    ///
    /// - `EmptyInput` for a zero-length input
    /// - `Engine` if the guest rejects the input
    /// - `Unrecoverable` if the client is closed
    pub async fn load_input(
        &mut self,
        input: InputSource,
        options: LoadOptions,
    ) -> Result<(), RuntimeError> {
        self.begin()?;
        let result = self.load_input_inner(input, options).await;
        self.finish(result)
    }

    async fn load_input_inner(
        &mut self,
        mut input: InputSource,
        options: LoadOptions,
    ) -> Result<(), RuntimeError> {
        let handle = self.handle;
        let sb = self.sandbox()?;

        sb.call("engine_clear_input", |e| &e.engine_clear_input, handle)
            .await?;

        let region = memory::marshal(sb, &mut input).await?;
        let result = sb
            .call(
                "engine_load_input",
                |e| &e.engine_load_input,
                (handle, region.ptr_arg(), region.len_arg(), options.flags()),
            )
            .await;
        let freed = memory::free(sb, region).await;
        check(sb, "engine_load_input", result?).await?;
        freed
    }

    /// Run recognition on the loaded input.
    ///
    /// `progress` receives percentages while the guest works.
    ///
    /// # Errors
    ///
    /// - `Engine` carrying the guest's last error if extraction fails, or
    ///   "empty result" if the guest returned no text
    /// - `Trap` if the guest traps; the client is closed
    pub async fn extract(
        &mut self,
        output: OutputKind,
        progress: Option<ProgressCallback>,
    ) -> Result<String, RuntimeError> {
        self.begin()?;
        let result = self.extract_inner(output, progress).await;
        self.finish(result)
    }

    async fn extract_inner(
        &mut self,
        output: OutputKind,
        progress: Option<ProgressCallback>,
    ) -> Result<String, RuntimeError> {
        let handle = self.handle;
        let sb = self.sandbox()?;

        sb.store_mut().data_mut().set_progress(progress);
        let result = sb
            .call(
                "engine_extract",
                |e| &e.engine_extract,
                (handle, output.code()),
            )
            .await;
        sb.store_mut().data_mut().set_progress(None);

        let ptr = result?;
        if ptr == 0 {
            let err_ptr = sb
                .call("engine_last_error", |e| &e.engine_last_error, handle)
                .await?;
            let message = memory::read_and_free(sb, guest_ptr(err_ptr)).await?;
            let message = if message.is_empty() {
                "extraction failed".to_string()
            } else {
                message
            };
            return Err(RuntimeError::engine("engine_extract", message));
        }

        // An unterminated result also reads as empty
        let text = memory::read_and_free(sb, guest_ptr(ptr)).await?;
        if text.is_empty() {
            return Err(RuntimeError::engine("engine_extract", "empty result"));
        }
        Ok(text)
    }

    /// Load `input` and extract it in one step.
    #[instrument(skip_all, fields(client_id = %self.id))]
    pub async fn process(
        &mut self,
        input: InputSource,
        options: &ExtractOptions,
    ) -> Result<String, RuntimeError> {
        self.begin()?;
        let result = match self.load_input_inner(input, options.load).await {
            Ok(()) => {
                self.extract_inner(options.output, options.progress.clone())
                    .await
            }
            Err(e) => Err(e),
        };
        self.finish(result)
    }

    /// Delete the engine and drop the sandbox.
    ///
    /// Idempotent: closing a closed client returns `Ok`.
    pub async fn close(&mut self) -> Result<(), RuntimeError> {
        self.state = ClientState::Closed;
        let Some(mut sb) = self.sandbox.take() else {
            return Ok(());
        };
        if sb.is_closed() || self.handle == 0 {
            return Ok(());
        }

        let handle = self.handle;
        let mut result = sb
            .call("engine_clear_input", |e| &e.engine_clear_input, handle)
            .await;
        if result.is_ok() {
            result = sb
                .call("engine_delete", |e| &e.engine_delete, handle)
                .await;
        }
        sb.shutdown();

        debug!(client_id = %self.id, "Engine client closed");
        result
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ClientState::Closed
    }

    /// Recent guest log lines, oldest first. Empty once closed.
    pub fn guest_logs(&self) -> Vec<LogEntry> {
        self.sandbox
            .as_ref()
            .map(|sb| sb.store().data().logs().cloned().collect())
            .unwrap_or_default()
    }

    /// The live sandbox, if the client is not closed.
    pub fn sandbox_mut(&mut self) -> Option<&mut Sandbox> {
        self.sandbox.as_mut()
    }

    fn sandbox(&mut self) -> Result<&mut Sandbox, RuntimeError> {
        match self.sandbox.as_mut() {
            Some(sb) if !sb.is_closed() => Ok(sb),
            _ => Err(RuntimeError::unrecoverable(format!(
                "engine client '{}' is closed",
                self.id
            ))),
        }
    }

    fn begin(&mut self) -> Result<(), RuntimeError> {
        match self.state {
            ClientState::Ready => {
                self.state = ClientState::Busy;
                Ok(())
            }
            ClientState::Closed => Err(RuntimeError::unrecoverable(format!(
                "engine client '{}' is closed",
                self.id
            ))),
            state => Err(RuntimeError::unrecoverable(format!(
                "engine client '{}' is {state:?}",
                self.id
            ))),
        }
    }

    fn finish<T>(&mut self, result: Result<T, RuntimeError>) -> Result<T, RuntimeError> {
        if self.sandbox.as_ref().is_some_and(Sandbox::is_closed) {
            warn!(client_id = %self.id, "Guest trapped; engine client closed");
            self.sandbox = None;
            self.state = ClientState::Closed;
        } else if self.state == ClientState::Busy {
            self.state = ClientState::Ready;
        }
        result
    }
}

impl std::fmt::Debug for EngineClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineClient")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Turn an error-string return into a result, reading and freeing the message.
async fn check(sb: &mut Sandbox, operation: &'static str, err_ptr: i32) -> Result<(), RuntimeError> {
    if err_ptr == 0 {
        return Ok(());
    }
    let message = memory::read_and_free(sb, guest_ptr(err_ptr)).await?;
    Err(RuntimeError::engine(operation, message))
}

async fn free_both(
    sb: &mut Sandbox,
    first: memory::GuestRegion,
    second: memory::GuestRegion,
) -> Result<(), RuntimeError> {
    let first = memory::free(sb, first).await;
    let second = memory::free(sb, second).await;
    first.and(second)
}

#[allow(clippy::cast_sign_loss)]
fn guest_ptr(ptr: i32) -> u32 {
    ptr as u32
}
