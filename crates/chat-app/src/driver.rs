//! Line-oriented terminal front end over the conversation engine.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};

use arbor_core::{
    BranchStep, ContentPart, Conversation, ConversationId, ConversationService,
    ConversationSummary, ErrorKind, Message, MessageStatus, Role, StreamHandle, StreamListener,
    StreamOutcome, StreamSessionId, StreamTarget, StreamingController, Subscription, tree,
};
use snafu::{OptionExt, ResultExt};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::error::{
    AppResult, EngineSnafu, IndexOutOfRangeSnafu, InvalidCommandSnafu, NoConversationSnafu,
    ReadInputSnafu, SettingsSnafu,
};
use crate::settings::{Settings, SettingsService};

const HELP: &str = "\
commands:
  <text>             send a message
  /new               start a conversation
  /list              list conversations
  /open <n>          open conversation n from the last /list
  /edit <n> <text>   resend message n with new text as a branch
  /regen             regenerate the last reply
  /prev <n>          show the previous branch at message n
  /next <n>          show the next branch at message n
  /delete <n>        delete message n and its replies
  /collapse          drop every branch off the shown path
  /rename <title>    rename the conversation
  /model <id>        switch the model for new replies
  /retry             save a reply that failed to persist
  /help              show this help
  /quit              exit
ctrl-c stops a reply while it streams";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    New,
    List,
    Open(usize),
    Edit { index: usize, text: String },
    Regenerate,
    Previous(usize),
    Next(usize),
    Delete(usize),
    Collapse,
    Rename(String),
    Model(String),
    Retry,
    Help,
    Quit,
}

impl Command {
    /// `None` for blank lines.
    pub fn parse(line: &str) -> AppResult<Option<Self>> {
        let stage = "parse-command";
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Some(Self::Send(line.to_string())));
        };

        let (name, args) = rest
            .split_once(char::is_whitespace)
            .map_or((rest, ""), |(name, args)| (name, args.trim()));
        let command = match name.to_ascii_lowercase().as_str() {
            "new" => Self::New,
            "list" | "ls" => Self::List,
            "open" => Self::Open(index_arg(args, stage)?),
            "edit" => {
                let (index, text) = args.split_once(char::is_whitespace).context(
                    InvalidCommandSnafu {
                        stage,
                        details: "usage: /edit <n> <text>",
                    },
                )?;
                Self::Edit {
                    index: index_arg(index, stage)?,
                    text: text.trim().to_string(),
                }
            }
            "regen" | "regenerate" => Self::Regenerate,
            "prev" => Self::Previous(index_arg(args, stage)?),
            "next" => Self::Next(index_arg(args, stage)?),
            "delete" | "rm" => Self::Delete(index_arg(args, stage)?),
            "collapse" => Self::Collapse,
            "rename" => Self::Rename(required_arg(args, "/rename <title>", stage)?),
            "model" => Self::Model(required_arg(args, "/model <id>", stage)?),
            "retry" => Self::Retry,
            "help" | "?" => Self::Help,
            "quit" | "exit" | "q" => Self::Quit,
            other => {
                return InvalidCommandSnafu {
                    stage,
                    details: format!("unknown command '/{other}', try /help"),
                }
                .fail();
            }
        };
        Ok(Some(command))
    }
}

fn index_arg(value: &str, stage: &'static str) -> AppResult<usize> {
    match value.trim().parse::<usize>() {
        Ok(index) if index > 0 => Ok(index),
        _ => InvalidCommandSnafu {
            stage,
            details: format!("expected a positive number, got '{}'", value.trim()),
        }
        .fail(),
    }
}

fn required_arg(value: &str, usage: &str, stage: &'static str) -> AppResult<String> {
    let value = value.trim();
    if value.is_empty() {
        return InvalidCommandSnafu {
            stage,
            details: format!("usage: {usage}"),
        }
        .fail();
    }
    Ok(value.to_string())
}

/// Shared, flushed-on-write output sink.
#[derive(Clone)]
pub struct Console {
    sink: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Console {
    pub fn new(sink: Box<dyn Write + Send>) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    pub fn print(&self, text: &str) {
        let mut sink = lock(&self.sink);
        if let Err(error) = sink.write_all(text.as_bytes()).and_then(|()| sink.flush()) {
            tracing::debug!(error = %error, "console write failed");
        }
    }

    pub fn line(&self, text: impl AsRef<str>) {
        self.print(&format!("{}\n", text.as_ref()));
    }
}

/// Prints streamed text as it grows.
struct DeltaPrinter {
    console: Console,
    printed: Mutex<HashMap<StreamSessionId, usize>>,
}

impl StreamListener for DeltaPrinter {
    fn on_stream_start(&self, target: StreamTarget) {
        lock(&self.printed).insert(target.session_id, 0);
        self.console.print("assistant: ");
    }

    fn on_stream_delta(&self, target: StreamTarget, conversation: &Conversation) {
        let Some(text) = conversation
            .pending_message()
            .filter(|message| message.status == MessageStatus::Pending(target.session_id))
            .map(Message::text)
        else {
            return;
        };
        let mut printed = lock(&self.printed);
        let seen = printed.entry(target.session_id).or_default();
        if let Some(fresh) = text.get(*seen..)
            && !fresh.is_empty()
        {
            self.console.print(fresh);
            *seen = text.len();
        }
    }

    fn on_stream_end(&self, target: StreamTarget, outcome: &StreamOutcome) {
        let printed = lock(&self.printed)
            .remove(&target.session_id)
            .unwrap_or_default();
        match outcome {
            StreamOutcome::Committed(message) if printed == 0 => self.console.line(message.text()),
            StreamOutcome::Committed(_) => self.console.line(""),
            StreamOutcome::Cancelled => self.console.line(" [stopped]"),
            StreamOutcome::Failed(_) => self.console.line(" [failed]"),
        }
    }
}

pub enum Flow {
    Continue,
    Quit,
}

pub struct Driver {
    service: Arc<ConversationService>,
    controller: StreamingController,
    settings: Arc<SettingsService>,
    console: Console,
    current: Option<ConversationId>,
    listing: Vec<ConversationSummary>,
    unsaved: Option<(ConversationId, Message)>,
    _subscriptions: Vec<Subscription>,
}

impl Driver {
    pub fn new(
        service: Arc<ConversationService>,
        controller: StreamingController,
        settings: Arc<SettingsService>,
        console: Console,
    ) -> Self {
        let printer = controller.subscribe(Arc::new(DeltaPrinter {
            console: console.clone(),
            printed: Mutex::new(HashMap::new()),
        }));
        let options_target = controller.clone();
        let options = settings.subscribe(Arc::new(move |settings: &Settings| {
            options_target.set_options(settings.completion_options());
        }));

        Self {
            service,
            controller,
            settings,
            console,
            current: None,
            listing: Vec::new(),
            unsaved: None,
            _subscriptions: vec![printer, options],
        }
    }

    pub fn current(&self) -> Option<ConversationId> {
        self.current
    }

    pub async fn run<R>(&mut self, input: R) -> AppResult<()>
    where
        R: AsyncBufRead + Unpin,
    {
        self.console.line("arbor, type /help for commands");
        let mut lines = input.lines();
        while let Some(line) = lines
            .next_line()
            .await
            .context(ReadInputSnafu { stage: "read-line" })?
        {
            match self.handle_line(&line).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Quit) => break,
                Err(error) => {
                    tracing::debug!(error = %error, "command failed");
                    self.console.line(format!("error: {error}"));
                }
            }
        }
        Ok(())
    }

    pub async fn handle_line(&mut self, line: &str) -> AppResult<Flow> {
        let Some(command) = Command::parse(line)? else {
            return Ok(Flow::Continue);
        };
        self.execute(command).await
    }

    pub async fn execute(&mut self, command: Command) -> AppResult<Flow> {
        match command {
            Command::Send(text) => {
                let conversation_id = match self.current {
                    Some(conversation_id) => conversation_id,
                    None => self.open_new().await?.id,
                };
                let handle = self
                    .controller
                    .send(conversation_id, vec![ContentPart::text(text)])
                    .await
                    .context(EngineSnafu { stage: "send" })?;
                self.await_stream(handle).await;
            }
            Command::New => {
                let conversation = self.open_new().await?;
                self.console.line(format!("opened \"{}\"", conversation.title));
            }
            Command::List => self.list().await?,
            Command::Open(index) => {
                let summary = pick(&self.listing, index, "open")?.clone();
                self.current = Some(summary.id);
                self.render(summary.id).await?;
            }
            Command::Edit { index, text } => {
                let (conversation_id, message) = self.path_message(index, "edit").await?;
                let handle = self
                    .controller
                    .resend_edited(conversation_id, message.id, vec![ContentPart::text(text)])
                    .await
                    .context(EngineSnafu { stage: "edit" })?;
                self.await_stream(handle).await;
            }
            Command::Regenerate => {
                let stage = "regenerate";
                let conversation_id = self.require_current(stage)?;
                let path = self.visible(conversation_id, stage).await?;
                let last_reply = path
                    .iter()
                    .rev()
                    .find(|message| message.role == Role::Assistant)
                    .context(InvalidCommandSnafu {
                        stage,
                        details: "there is no reply to regenerate",
                    })?;
                let handle = self
                    .controller
                    .regenerate(conversation_id, last_reply.id)
                    .await
                    .context(EngineSnafu { stage })?;
                self.await_stream(handle).await;
            }
            Command::Previous(index) => self.step(index, BranchStep::Previous).await?,
            Command::Next(index) => self.step(index, BranchStep::Next).await?,
            Command::Delete(index) => {
                let (conversation_id, message) = self.path_message(index, "delete").await?;
                self.service
                    .delete_message(conversation_id, message.id)
                    .await
                    .context(EngineSnafu { stage: "delete" })?;
                self.render(conversation_id).await?;
            }
            Command::Collapse => {
                let stage = "collapse";
                let conversation_id = self.require_current(stage)?;
                self.service
                    .collapse_to_active_path(conversation_id)
                    .await
                    .context(EngineSnafu { stage })?;
                self.render(conversation_id).await?;
            }
            Command::Rename(title) => {
                let stage = "rename";
                let conversation_id = self.require_current(stage)?;
                let conversation = self
                    .service
                    .rename_conversation(conversation_id, &title)
                    .await
                    .context(EngineSnafu { stage })?;
                self.console.line(format!("renamed to \"{}\"", conversation.title));
            }
            Command::Model(model) => {
                let mut settings = (*self.settings.settings()).clone();
                settings.provider.model = model;
                let stored = self
                    .settings
                    .update(settings)
                    .context(SettingsSnafu { stage: "switch-model" })?;
                self.console
                    .line(format!("model set to {}", stored.provider.model));
            }
            Command::Retry => self.retry().await?,
            Command::Help => self.console.line(HELP),
            Command::Quit => return Ok(Flow::Quit),
        }
        Ok(Flow::Continue)
    }

    async fn open_new(&mut self) -> AppResult<Conversation> {
        let conversation = self
            .service
            .create_conversation("", None)
            .await
            .context(EngineSnafu { stage: "new" })?;
        self.current = Some(conversation.id);
        Ok(conversation)
    }

    async fn list(&mut self) -> AppResult<()> {
        self.listing = self
            .service
            .list_conversations()
            .await
            .context(EngineSnafu { stage: "list" })?;
        if self.listing.is_empty() {
            self.console.line("no conversations yet");
        }
        for (position, summary) in self.listing.iter().enumerate() {
            let marker = if Some(summary.id) == self.current { "*" } else { " " };
            self.console
                .line(format!("{marker}[{}] {}", position + 1, summary.title));
        }
        Ok(())
    }

    async fn step(&mut self, index: usize, step: BranchStep) -> AppResult<()> {
        let stage = "switch-branch";
        let (conversation_id, message) = self.path_message(index, stage).await?;
        self.service
            .switch_branch(conversation_id, message.id, step)
            .await
            .context(EngineSnafu { stage })?;
        self.render(conversation_id).await
    }

    async fn retry(&mut self) -> AppResult<()> {
        let stage = "retry";
        let (conversation_id, message) = self.unsaved.take().context(InvalidCommandSnafu {
            stage,
            details: "there is no unsaved reply",
        })?;
        let Some(father_id) = message.parent_id else {
            return InvalidCommandSnafu {
                stage,
                details: "the unsaved reply has no parent",
            }
            .fail();
        };

        match self
            .service
            .commit_assistant_turn(conversation_id, father_id, message.clone())
            .await
        {
            Ok(_) => self.render(conversation_id).await,
            Err(source) => {
                self.unsaved = Some((conversation_id, message));
                Err(source).context(EngineSnafu { stage })
            }
        }
    }

    async fn await_stream(&mut self, handle: StreamHandle) {
        let conversation_id = handle.target().conversation_id;
        let outcome = handle.outcome();
        tokio::pin!(outcome);

        let outcome = tokio::select! {
            outcome = &mut outcome => outcome,
            Ok(()) = tokio::signal::ctrl_c() => {
                self.controller.stop(conversation_id);
                outcome.await
            }
        };

        if let StreamOutcome::Failed(error) = outcome {
            if error.kind() == ErrorKind::UnsavedResponse
                && let Some(message) = error.unsaved_message()
            {
                self.unsaved = Some((conversation_id, message.clone()));
                self.console
                    .line(format!("error: {error}, use /retry to save the reply"));
            } else {
                self.console.line(format!("error: {error}"));
            }
        }
    }

    async fn render(&self, conversation_id: ConversationId) -> AppResult<()> {
        let conversation = self
            .service
            .get_conversation(conversation_id)
            .await
            .context(EngineSnafu { stage: "render" })?;
        self.console.line(format!("== {}", conversation.title));
        for (position, message) in tree::visible_path(&conversation).into_iter().enumerate() {
            let branch = tree::branch_position(&conversation, message.id)
                .filter(|branch| branch.count > 1)
                .map(|branch| format!(" ({}/{})", branch.index + 1, branch.count))
                .unwrap_or_default();
            self.console.line(format!(
                "[{}]{branch} {}: {}",
                position + 1,
                role_label(message.role),
                message.rendered_content()
            ));
        }
        Ok(())
    }

    fn require_current(&self, stage: &'static str) -> AppResult<ConversationId> {
        self.current.context(NoConversationSnafu { stage })
    }

    async fn visible(
        &self,
        conversation_id: ConversationId,
        stage: &'static str,
    ) -> AppResult<Vec<Message>> {
        self.service
            .visible_path(conversation_id)
            .await
            .context(EngineSnafu { stage })
    }

    /// The `index`-th (1-based) message of the shown path.
    async fn path_message(
        &self,
        index: usize,
        stage: &'static str,
    ) -> AppResult<(ConversationId, Message)> {
        let conversation_id = self.require_current(stage)?;
        let path = self.visible(conversation_id, stage).await?;
        let message = pick(&path, index, stage)?.clone();
        Ok((conversation_id, message))
    }
}

fn pick<'a, T>(items: &'a [T], index: usize, stage: &'static str) -> AppResult<&'a T> {
    index
        .checked_sub(1)
        .and_then(|position| items.get(position))
        .context(IndexOutOfRangeSnafu {
            stage,
            index,
            len: items.len(),
        })
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "you",
        Role::Assistant => "assistant",
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use arbor_core::{CompletionOptions, ServiceConfig};
    use arbor_llm::{ScriptStep, ScriptedProvider};
    use arbor_storage::SqliteStorage;

    use super::*;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&lock(&self.0)).into_owned()
        }
    }

    impl Write for Captured {
        fn write(&mut self, bytes: &[u8]) -> std::io::Result<usize> {
            lock(&self.0).extend_from_slice(bytes);
            Ok(bytes.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        driver: Driver,
        service: Arc<ConversationService>,
        controller: StreamingController,
        provider: Arc<ScriptedProvider>,
        output: Captured,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("temp dir");
        let database = dir.path().join("arbor.db");
        let storage = SqliteStorage::open(&database.to_string_lossy())
            .await
            .expect("sqlite opens");
        let service = Arc::new(ConversationService::new(
            Arc::new(storage),
            ServiceConfig::default(),
        ));
        service.initialize().await.expect("service ready");

        let provider = Arc::new(ScriptedProvider::new());
        let controller = StreamingController::new(
            Arc::clone(&service),
            provider.clone(),
            CompletionOptions::default(),
        );
        let settings = Arc::new(SettingsService::new(dir.path().join("settings.json")));
        let output = Captured::default();
        let driver = Driver::new(
            Arc::clone(&service),
            controller.clone(),
            settings,
            Console::new(Box::new(output.clone())),
        );

        Fixture {
            driver,
            service,
            controller,
            provider,
            output,
            _dir: dir,
        }
    }

    #[test]
    fn commands_parse_with_arguments() {
        assert_eq!(Command::parse("   ").expect("blank"), None);
        assert_eq!(
            Command::parse("hello there").expect("send"),
            Some(Command::Send("hello there".to_string()))
        );
        assert_eq!(
            Command::parse("/edit 2  new words ").expect("edit"),
            Some(Command::Edit {
                index: 2,
                text: "new words".to_string(),
            })
        );
        assert_eq!(Command::parse("/PREV 3").expect("prev"), Some(Command::Previous(3)));
        assert_eq!(
            Command::parse("/rename  Trip plans ").expect("rename"),
            Some(Command::Rename("Trip plans".to_string()))
        );
        assert!(Command::parse("/open 0").is_err());
        assert!(Command::parse("/edit 2").is_err());
        assert!(Command::parse("/rename").is_err());
        assert!(Command::parse("/bogus").is_err());
    }

    #[tokio::test]
    async fn session_script_branches_and_navigates() {
        let mut fixture = fixture().await;
        fixture.provider.push_deltas(["Hi", " there"]);
        fixture.provider.push_deltas(["Howdy"]);

        let input: &[u8] = b"Hello\n/regen\n/prev 2\n/quit\nignored after quit\n";
        fixture.driver.run(input).await.expect("driver runs");

        let output = fixture.output.text();
        assert!(output.contains("assistant: Hi there"));
        assert!(output.contains("assistant: Howdy"));
        assert!(output.contains("[2] (1/2) assistant: Hi there"));

        let conversation_id = fixture.driver.current().expect("conversation opened");
        let path = fixture
            .service
            .visible_path(conversation_id)
            .await
            .expect("path");
        let texts = path.iter().map(Message::text).collect::<Vec<_>>();
        assert_eq!(texts, vec!["Hello", "Hi there"]);
        assert_eq!(fixture.provider.requests().len(), 2);
    }

    #[tokio::test]
    async fn edits_and_deletes_operate_on_shown_indices() {
        let mut fixture = fixture().await;
        fixture.driver.handle_line("Hello").await.expect("send");
        fixture
            .driver
            .handle_line("/edit 1 Hello again")
            .await
            .expect("edit");

        let conversation_id = fixture.driver.current().expect("open");
        let texts = |path: Vec<Message>| path.iter().map(Message::text).collect::<Vec<_>>();
        let path = fixture.service.visible_path(conversation_id).await.expect("path");
        assert_eq!(texts(path), vec!["Hello again", "echo: Hello again"]);

        fixture.driver.handle_line("/delete 2").await.expect("delete");
        let path = fixture.service.visible_path(conversation_id).await.expect("path");
        assert_eq!(texts(path), vec!["Hello again"]);

        fixture.driver.handle_line("/collapse").await.expect("collapse");
        let conversation = fixture
            .service
            .get_conversation(conversation_id)
            .await
            .expect("conversation");
        assert_eq!(conversation.messages.len(), 2);

        let error = fixture
            .driver
            .handle_line("/delete 9")
            .await
            .err()
            .expect("out of range");
        assert!(error.to_string().contains("no entry 9"));
    }

    #[tokio::test]
    async fn failed_streams_are_reported_and_model_switches_apply() {
        let mut fixture = fixture().await;
        fixture
            .provider
            .push_script(vec![ScriptStep::Fail("quota exceeded".to_string())]);
        fixture.driver.handle_line("Hello").await.expect("send returns");
        assert!(fixture.output.text().contains("quota exceeded"));
        assert!(!fixture.controller.is_streaming(fixture.driver.current().expect("open")));

        fixture
            .driver
            .handle_line("/model tiny-model")
            .await
            .expect("model switch");
        assert_eq!(fixture.controller.options().model_id, "tiny-model");

        fixture.driver.handle_line("/regen").await.err().expect("no reply yet");
        fixture.driver.handle_line("/new").await.expect("new");
        fixture.driver.handle_line("/list").await.expect("list");
        let output = fixture.output.text();
        let current = output
            .lines()
            .find(|line| line.starts_with('*'))
            .expect("current conversation is marked");
        assert!(current.ends_with("New Conversation"));
    }
}
