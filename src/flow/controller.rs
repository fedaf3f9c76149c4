//! The conversation state machine.
//!
//! Every incoming event is handled against the user's current [`FlowState`]. Prompt
//! submission does not call the provider inline: it claims the user's in-flight slot, moves
//! the session to `Generating` and hands back a [`GenerationJob`] for the transport to spawn.
//! The job charges the account only after the image has been delivered.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::flow::catalog::{AspectFormat, ImageModel, ModelCatalog};
use crate::flow::intent::{Intent, Mode};
use crate::flow::ports::{AccountStore, DeliveryChannel, EligibilityGate};
use crate::flow::screens::{self, Menu};
use crate::flow::session::{FlowState, LastGeneration, Session, SessionStore};
use crate::llm::media::is_image;
use crate::llm::{GenerationRequest, GenerationResult, ImageGenerator};
use crate::utils::imaging::{prepare_for_delivery, EncodingPolicy};
use crate::utils::timing::log_generation_outcome;

const SOMETHING_WENT_WRONG_TEXT: &str = "Something went wrong. Please start again from the main menu.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowEvent {
    Start,
    Intent(Intent),
    Text(String),
    Photo {
        bytes: Vec<u8>,
        caption: Option<String>,
    },
    /// Stickers, voice notes, non-image files and the like.
    Unsupported,
}

impl FlowEvent {
    fn kind(&self) -> &'static str {
        match self {
            FlowEvent::Start => "start",
            FlowEvent::Intent(_) => "intent",
            FlowEvent::Text(_) => "text",
            FlowEvent::Photo { .. } => "photo",
            FlowEvent::Unsupported => "unsupported",
        }
    }

    fn allowed_while_generating(&self) -> bool {
        matches!(
            self,
            FlowEvent::Start
                | FlowEvent::Intent(Intent::MainMenu | Intent::TopUpMenu | Intent::About)
        )
    }
}

pub struct FlowDeps {
    pub accounts: Arc<dyn AccountStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub gate: Arc<dyn EligibilityGate>,
    pub generator: Arc<dyn ImageGenerator>,
    pub delivery: Arc<dyn DeliveryChannel>,
}

#[derive(Debug, Clone)]
pub struct FlowSettings {
    pub catalog: ModelCatalog,
    pub encoding: EncodingPolicy,
    pub prompts_channel_url: Option<String>,
}

struct Inner {
    deps: FlowDeps,
    settings: FlowSettings,
    in_flight: Mutex<HashSet<i64>>,
}

#[derive(Clone)]
pub struct FlowController {
    inner: Arc<Inner>,
}

/// Holds a user's in-flight slot; released on drop.
struct InFlightGuard {
    inner: Arc<Inner>,
    user_id: i64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.lock().remove(&self.user_id);
    }
}

/// One generation attempt, ready to run on its own task.
pub struct GenerationJob {
    controller: FlowController,
    user_id: i64,
    prompt: String,
    source_image: Option<Arc<Vec<u8>>>,
    model: ImageModel,
    format: AspectFormat,
    previous: Option<LastGeneration>,
    _slot: InFlightGuard,
}

impl FlowController {
    pub fn new(deps: FlowDeps, settings: FlowSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                deps,
                settings,
                in_flight: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.inner.settings.catalog
    }

    /// True when the user's next photo would be used as a source image. Lets the
    /// transport skip downloading uploads the current state would reject anyway.
    pub fn wants_photo(&self, user_id: i64) -> bool {
        self.sessions().get(user_id).state == FlowState::AwaitingImage
    }

    fn accounts(&self) -> &dyn AccountStore {
        self.inner.deps.accounts.as_ref()
    }

    fn sessions(&self) -> &dyn SessionStore {
        self.inner.deps.sessions.as_ref()
    }

    fn delivery(&self) -> &dyn DeliveryChannel {
        self.inner.deps.delivery.as_ref()
    }

    fn main_menu(&self) -> Menu {
        screens::main_menu(self.inner.settings.prompts_channel_url.as_deref())
    }

    /// Handles one event. A returned job must be run for the user to get an answer.
    pub async fn handle(&self, user_id: i64, event: FlowEvent) -> Result<Option<GenerationJob>> {
        match self.dispatch(user_id, event).await {
            Ok(job) => Ok(job),
            Err(err) => {
                error!(user_id, "Flow event failed: {err:#}");
                self.sessions().clear(user_id);
                let menu = self.main_menu();
                if let Err(send_err) = self
                    .delivery()
                    .send_text(user_id, SOMETHING_WENT_WRONG_TEXT, Some(&menu))
                    .await
                {
                    warn!(user_id, "Failed to send error notice: {send_err:#}");
                }
                Err(err)
            }
        }
    }

    async fn dispatch(&self, user_id: i64, event: FlowEvent) -> Result<Option<GenerationJob>> {
        let session = self.sessions().get(user_id);
        debug!(
            user_id,
            state = session.state.name(),
            event = event.kind(),
            "Handling flow event"
        );

        if session.state == FlowState::Generating && !event.allowed_while_generating() {
            self.delivery()
                .send_text(user_id, screens::BUSY_TEXT, None)
                .await?;
            return Ok(None);
        }

        match event {
            FlowEvent::Start => {
                self.show_main_menu(user_id).await?;
                Ok(None)
            }
            FlowEvent::Intent(intent) => self.on_intent(user_id, session, intent).await,
            FlowEvent::Text(text) => self.on_text(user_id, session, text).await,
            FlowEvent::Photo { bytes, caption } => {
                self.on_photo(user_id, session, bytes, caption).await
            }
            FlowEvent::Unsupported => {
                let note = match session.state {
                    FlowState::AwaitingImage => screens::EXPECTED_PHOTO_TEXT,
                    FlowState::AwaitingPrompt { .. } => screens::EXPECTED_TEXT_TEXT,
                    _ => screens::USE_BUTTONS_TEXT,
                };
                self.render_current(user_id, &session, note).await?;
                Ok(None)
            }
        }
    }

    async fn show_main_menu(&self, user_id: i64) -> Result<()> {
        let account = self.accounts().create_if_absent(user_id).await?;
        self.sessions().clear(user_id);
        let menu = self.main_menu();
        self.delivery()
            .send_text(user_id, &screens::welcome_text(&account), Some(&menu))
            .await
    }

    /// Re-sends the screen that belongs to the current state, prefixed with `note`.
    async fn render_current(&self, user_id: i64, session: &Session, note: &str) -> Result<()> {
        let menu = match &session.state {
            FlowState::Idle => self.main_menu(),
            FlowState::ChoosingModel => {
                let account = self.accounts().create_if_absent(user_id).await?;
                let selected = self.catalog().resolve(account.selected_model.as_deref());
                screens::model_menu(self.catalog(), selected)
            }
            FlowState::ChoosingMode => screens::mode_menu(),
            FlowState::ChoosingFormat { .. } => {
                let account = self.accounts().create_if_absent(user_id).await?;
                screens::format_menu(account.selected_format)
            }
            FlowState::AwaitingImage | FlowState::AwaitingPrompt { .. } => screens::cancel_menu(),
            FlowState::PostGeneration => screens::post_generation_menu(
                session
                    .last
                    .as_ref()
                    .is_some_and(|last| last.source_image.is_some()),
            ),
            FlowState::Generating => {
                return self
                    .delivery()
                    .send_text(user_id, screens::BUSY_TEXT, None)
                    .await;
            }
        };
        self.delivery().send_text(user_id, note, Some(&menu)).await
    }

    async fn stale(&self, user_id: i64, session: &Session, intent: &Intent) -> Result<Option<GenerationJob>> {
        info!(
            user_id,
            state = session.state.name(),
            intent = %intent.callback_data(),
            "Ignoring intent that does not apply to the current state"
        );
        self.render_current(user_id, session, screens::STALE_MENU_TEXT)
            .await?;
        Ok(None)
    }

    /// Sends the remediation prompt and returns false when the user may not generate.
    async fn ensure_eligible(&self, user_id: i64) -> Result<bool> {
        if self.inner.deps.gate.is_eligible(user_id).await {
            return Ok(true);
        }
        info!(user_id, "Eligibility gate denied the generation flow");
        let url = self.inner.deps.gate.remediation_url();
        let menu = screens::remediation_menu(url.as_deref());
        self.delivery()
            .send_text(user_id, screens::REMEDIATION_TEXT, Some(&menu))
            .await?;
        Ok(false)
    }

    async fn on_intent(
        &self,
        user_id: i64,
        session: Session,
        intent: Intent,
    ) -> Result<Option<GenerationJob>> {
        match intent {
            Intent::MainMenu => {
                self.show_main_menu(user_id).await?;
                Ok(None)
            }
            Intent::OpenGenerate | Intent::CheckSubscription => {
                if !self.ensure_eligible(user_id).await? {
                    return Ok(None);
                }
                let account = self.accounts().create_if_absent(user_id).await?;
                let selected = self.catalog().resolve(account.selected_model.as_deref());
                let menu = screens::model_menu(self.catalog(), selected);
                self.sessions()
                    .set(user_id, Session::with_state(FlowState::ChoosingModel, None));
                self.delivery()
                    .send_text(user_id, screens::PICK_MODEL_TEXT, Some(&menu))
                    .await?;
                Ok(None)
            }
            Intent::PickModel(ref key) => {
                if session.state != FlowState::ChoosingModel {
                    return self.stale(user_id, &session, &intent).await;
                }
                let Some(model) = self.catalog().get(key).cloned() else {
                    return self.stale(user_id, &session, &intent).await;
                };
                self.accounts().create_if_absent(user_id).await?;
                self.accounts().set_model(user_id, &model.key).await?;
                self.sessions()
                    .set(user_id, Session::with_state(FlowState::ChoosingMode, None));
                self.delivery()
                    .send_text(user_id, screens::PICK_MODE_TEXT, Some(&screens::mode_menu()))
                    .await?;
                Ok(None)
            }
            Intent::PickMode(mode) => {
                if session.state != FlowState::ChoosingMode {
                    return self.stale(user_id, &session, &intent).await;
                }
                let account = self.accounts().create_if_absent(user_id).await?;
                let model = self.catalog().resolve(account.selected_model.as_deref());
                self.sessions().set(
                    user_id,
                    Session::with_state(FlowState::ChoosingFormat { mode }, None),
                );
                self.delivery()
                    .send_text(
                        user_id,
                        &screens::format_prompt_text(model),
                        Some(&screens::format_menu(account.selected_format)),
                    )
                    .await?;
                Ok(None)
            }
            Intent::PickFormat(format) => {
                let FlowState::ChoosingFormat { mode } = session.state else {
                    return self.stale(user_id, &session, &intent).await;
                };
                if !self.ensure_eligible(user_id).await? {
                    return Ok(None);
                }
                self.accounts().create_if_absent(user_id).await?;
                self.accounts().set_format(user_id, format).await?;
                let (next, text) = match mode {
                    Mode::TextOnly => (
                        FlowState::AwaitingPrompt { source_image: None },
                        screens::SEND_PROMPT_TEXT,
                    ),
                    Mode::ImagePlusText => (FlowState::AwaitingImage, screens::SEND_PHOTO_TEXT),
                };
                self.sessions()
                    .set(user_id, Session::with_state(next, None));
                self.delivery()
                    .send_text(user_id, text, Some(&screens::cancel_menu()))
                    .await?;
                Ok(None)
            }
            Intent::Regenerate => {
                let last = match (&session.state, &session.last) {
                    (FlowState::PostGeneration, Some(last)) => last.clone(),
                    _ => return self.stale(user_id, &session, &intent).await,
                };
                self.begin_generation(
                    user_id,
                    last.prompt.clone(),
                    last.source_image.clone(),
                    Some(last),
                )
                .await
            }
            Intent::EditPrompt => {
                let last = match (&session.state, &session.last) {
                    (FlowState::PostGeneration, Some(last)) => last.clone(),
                    _ => return self.stale(user_id, &session, &intent).await,
                };
                if !self.ensure_eligible(user_id).await? {
                    return Ok(None);
                }
                let text = if last.source_image.is_some() {
                    screens::SEND_EDIT_PROMPT_TEXT
                } else {
                    screens::SEND_PROMPT_TEXT
                };
                self.sessions().set(
                    user_id,
                    Session::with_state(
                        FlowState::AwaitingPrompt {
                            source_image: last.source_image.clone(),
                        },
                        Some(last),
                    ),
                );
                self.delivery()
                    .send_text(user_id, text, Some(&screens::cancel_menu()))
                    .await?;
                Ok(None)
            }
            Intent::AddPhoto => {
                if session.state != FlowState::PostGeneration || session.last.is_none() {
                    return self.stale(user_id, &session, &intent).await;
                }
                if !self.ensure_eligible(user_id).await? {
                    return Ok(None);
                }
                self.sessions().set(
                    user_id,
                    Session::with_state(FlowState::AwaitingImage, session.last),
                );
                self.delivery()
                    .send_text(
                        user_id,
                        screens::SEND_PHOTO_TEXT,
                        Some(&screens::cancel_menu()),
                    )
                    .await?;
                Ok(None)
            }
            Intent::TopUpMenu => {
                let account = self.accounts().create_if_absent(user_id).await?;
                self.delivery()
                    .send_text(
                        user_id,
                        &screens::top_up_text(&account),
                        Some(&screens::top_up_menu()),
                    )
                    .await?;
                Ok(None)
            }
            Intent::TopUp(package) => {
                info!(
                    user_id,
                    amount = package.amount(),
                    bonus = package.bonus(),
                    "Top-up package requested"
                );
                self.delivery()
                    .send_text(
                        user_id,
                        screens::TOP_UP_UNAVAILABLE_TEXT,
                        Some(&screens::cancel_menu()),
                    )
                    .await?;
                Ok(None)
            }
            Intent::About => {
                self.delivery()
                    .send_text(user_id, screens::ABOUT_TEXT, Some(&screens::cancel_menu()))
                    .await?;
                Ok(None)
            }
        }
    }

    async fn on_text(
        &self,
        user_id: i64,
        session: Session,
        text: String,
    ) -> Result<Option<GenerationJob>> {
        match session.state {
            FlowState::AwaitingPrompt { source_image } => {
                let prompt = text.trim();
                if prompt.is_empty() {
                    self.delivery()
                        .send_text(
                            user_id,
                            screens::EXPECTED_TEXT_TEXT,
                            Some(&screens::cancel_menu()),
                        )
                        .await?;
                    return Ok(None);
                }
                self.begin_generation(user_id, prompt.to_string(), source_image, session.last)
                    .await
            }
            FlowState::AwaitingImage => {
                self.delivery()
                    .send_text(
                        user_id,
                        screens::EXPECTED_PHOTO_TEXT,
                        Some(&screens::cancel_menu()),
                    )
                    .await?;
                Ok(None)
            }
            _ => {
                self.render_current(user_id, &session, screens::USE_BUTTONS_TEXT)
                    .await?;
                Ok(None)
            }
        }
    }

    async fn on_photo(
        &self,
        user_id: i64,
        session: Session,
        bytes: Vec<u8>,
        caption: Option<String>,
    ) -> Result<Option<GenerationJob>> {
        match session.state {
            FlowState::AwaitingImage => {
                if !is_image(&bytes) {
                    info!(user_id, size = bytes.len(), "Rejected upload that is not an image");
                    self.delivery()
                        .send_text(
                            user_id,
                            screens::INVALID_IMAGE_TEXT,
                            Some(&screens::cancel_menu()),
                        )
                        .await?;
                    return Ok(None);
                }
                if !self.ensure_eligible(user_id).await? {
                    return Ok(None);
                }
                let image = Arc::new(bytes);
                let caption = caption
                    .map(|text| text.trim().to_string())
                    .filter(|text| !text.is_empty());
                if let Some(prompt) = caption {
                    return self
                        .begin_generation(user_id, prompt, Some(image), session.last)
                        .await;
                }
                self.sessions().set(
                    user_id,
                    Session::with_state(
                        FlowState::AwaitingPrompt {
                            source_image: Some(image),
                        },
                        session.last,
                    ),
                );
                self.delivery()
                    .send_text(
                        user_id,
                        screens::SEND_EDIT_PROMPT_TEXT,
                        Some(&screens::cancel_menu()),
                    )
                    .await?;
                Ok(None)
            }
            FlowState::AwaitingPrompt { .. } => {
                self.delivery()
                    .send_text(
                        user_id,
                        screens::EXPECTED_TEXT_TEXT,
                        Some(&screens::cancel_menu()),
                    )
                    .await?;
                Ok(None)
            }
            _ => {
                self.render_current(user_id, &session, screens::USE_BUTTONS_TEXT)
                    .await?;
                Ok(None)
            }
        }
    }

    fn try_claim(&self, user_id: i64) -> Option<InFlightGuard> {
        if !self.inner.in_flight.lock().insert(user_id) {
            return None;
        }
        Some(InFlightGuard {
            inner: self.inner.clone(),
            user_id,
        })
    }

    async fn begin_generation(
        &self,
        user_id: i64,
        prompt: String,
        source_image: Option<Arc<Vec<u8>>>,
        previous: Option<LastGeneration>,
    ) -> Result<Option<GenerationJob>> {
        if !self.ensure_eligible(user_id).await? {
            return Ok(None);
        }
        let Some(slot) = self.try_claim(user_id) else {
            info!(user_id, "Dropping generation trigger while another is in flight");
            self.delivery()
                .send_text(user_id, screens::BUSY_TEXT, None)
                .await?;
            return Ok(None);
        };

        let account = self.accounts().create_if_absent(user_id).await?;
        let model = self
            .catalog()
            .resolve(account.selected_model.as_deref())
            .clone();
        if account.balance < model.price {
            info!(
                user_id,
                balance = account.balance,
                price = model.price,
                model = %model.key,
                "Insufficient funds for generation"
            );
            self.sessions().clear(user_id);
            let menu = self.main_menu();
            self.delivery()
                .send_text(
                    user_id,
                    &screens::insufficient_funds_text(account.balance, &model),
                    Some(&menu),
                )
                .await?;
            return Ok(None);
        }

        self.sessions().set(
            user_id,
            Session::with_state(FlowState::Generating, previous.clone()),
        );
        info!(
            user_id,
            model = %model.key,
            format = account.selected_format.tag(),
            with_image = source_image.is_some(),
            "Starting generation"
        );
        if let Err(err) = self
            .delivery()
            .send_text(user_id, screens::GENERATING_TEXT, None)
            .await
        {
            warn!(user_id, "Failed to send progress notice: {err:#}");
        }

        Ok(Some(GenerationJob {
            controller: self.clone(),
            user_id,
            prompt,
            source_image,
            model,
            format: account.selected_format,
            previous,
            _slot: slot,
        }))
    }

    /// Writes the job's outcome unless the user already navigated away.
    fn finish_session(&self, user_id: i64, next: FlowState, last: Option<LastGeneration>) {
        self.sessions().update(user_id, &mut |session: &mut Session| {
            if session.state == FlowState::Generating {
                session.state = next.clone();
                session.last = last.clone();
            }
        });
    }

    async fn finish_failed(&self, user_id: i64, previous: Option<LastGeneration>, text: &str) {
        let menu = match &previous {
            Some(last) => screens::post_generation_menu(last.source_image.is_some()),
            None => self.main_menu(),
        };
        let next = if previous.is_some() {
            FlowState::PostGeneration
        } else {
            FlowState::Idle
        };
        self.finish_session(user_id, next, previous);
        if let Err(err) = self.delivery().send_text(user_id, text, Some(&menu)).await {
            warn!(user_id, "Failed to send failure notice: {err:#}");
        }
    }

    async fn charge(&self, user_id: i64, model: &ImageModel) {
        let charged = match self.accounts().debit(user_id, model.price).await {
            Ok(true) => {
                info!(user_id, price = model.price, model = %model.key, "Charged for delivered image");
                model.price
            }
            Ok(false) => {
                warn!(user_id, price = model.price, "Balance no longer covers a delivered image; left uncharged");
                0
            }
            Err(err) => {
                error!(user_id, "Failed to charge for delivered image: {err:#}");
                0
            }
        };
        if let Err(err) = self
            .accounts()
            .record_generation(user_id, &model.key, charged)
            .await
        {
            error!(user_id, "Failed to record generation: {err:#}");
        }
    }
}

impl GenerationJob {
    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    /// Calls the provider, delivers the result and settles the account.
    pub async fn run(self) {
        let started = Instant::now();
        let controller = self.controller.clone();
        let user_id = self.user_id;
        let _activity = controller.delivery().start_activity(user_id);

        let request = GenerationRequest {
            prompt: self.prompt.clone(),
            model: self.model.model.clone(),
            format: self.format,
            source_image: self.source_image.clone(),
        };
        let result = controller.inner.deps.generator.generate(&request).await;

        let outcome = match result {
            GenerationResult::Failure { reason } => {
                warn!(
                    user_id,
                    model = %self.model.key,
                    kind = reason.kind(),
                    "Generation failed: {reason}"
                );
                controller
                    .finish_failed(user_id, self.previous.clone(), screens::GENERATION_FAILED_TEXT)
                    .await;
                "generation_failed"
            }
            GenerationResult::Success { image_bytes } if !is_image(&image_bytes) => {
                warn!(
                    user_id,
                    model = %self.model.key,
                    size = image_bytes.len(),
                    "Provider payload is not an image"
                );
                controller
                    .finish_failed(user_id, self.previous.clone(), screens::GENERATION_FAILED_TEXT)
                    .await;
                "not_an_image"
            }
            GenerationResult::Success { image_bytes } => {
                let policy = controller.inner.settings.encoding;
                let prepared = tokio::task::spawn_blocking(move || {
                    prepare_for_delivery(&image_bytes, policy)
                })
                .await;
                match prepared {
                    Err(err) => {
                        error!(user_id, "Image preparation task failed: {err}");
                        controller
                            .finish_failed(
                                user_id,
                                self.previous.clone(),
                                screens::GENERATION_FAILED_TEXT,
                            )
                            .await;
                        "prepare_failed"
                    }
                    Ok(image) => {
                        let menu = screens::post_generation_menu(self.source_image.is_some());
                        let caption = screens::generation_caption(&self.model);
                        match controller
                            .delivery()
                            .send_image(user_id, &image, &caption, Some(&menu))
                            .await
                        {
                            Ok(()) => {
                                controller.charge(user_id, &self.model).await;
                                controller.finish_session(
                                    user_id,
                                    FlowState::PostGeneration,
                                    Some(LastGeneration {
                                        prompt: self.prompt.clone(),
                                        source_image: self.source_image.clone(),
                                    }),
                                );
                                "delivered"
                            }
                            Err(err) => {
                                warn!(user_id, "Image delivery failed: {err:#}");
                                controller
                                    .finish_failed(
                                        user_id,
                                        self.previous.clone(),
                                        screens::DELIVERY_FAILED_TEXT,
                                    )
                                    .await;
                                "delivery_failed"
                            }
                        }
                    }
                }
            }
        };

        log_generation_outcome(user_id, &self.model.key, outcome, started);
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use anyhow::anyhow;
    use async_trait::async_trait;
    use image::{ImageFormat, Rgb, RgbImage};

    use super::*;
    use crate::db::database::Database;
    use crate::flow::session::InMemorySessionStore;
    use crate::llm::GenerationFailure;
    use crate::utils::imaging::{DeliveryMode, PreparedImage};

    const USER: i64 = 1001;

    fn png_bytes() -> Vec<u8> {
        let image = RgbImage::from_pixel(4, 4, Rgb([200, 30, 30]));
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    struct ScriptedGenerator {
        results: Mutex<Vec<GenerationResult>>,
        requests: Mutex<Vec<GenerationRequest>>,
    }

    impl ScriptedGenerator {
        /// Results are handed out in order; the last one repeats.
        fn new(results: Vec<GenerationResult>) -> Self {
            Self {
                results: Mutex::new(results),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.requests.lock().len()
        }
    }

    #[async_trait]
    impl ImageGenerator for ScriptedGenerator {
        async fn generate(&self, request: &GenerationRequest) -> GenerationResult {
            self.requests.lock().push(request.clone());
            let mut results = self.results.lock();
            if results.len() > 1 {
                results.remove(0)
            } else {
                results[0].clone()
            }
        }
    }

    #[derive(Default)]
    struct RecordingDelivery {
        texts: Mutex<Vec<(String, Option<Menu>)>>,
        images: Mutex<Vec<PreparedImage>>,
        fail_images: AtomicBool,
    }

    impl RecordingDelivery {
        fn last_text(&self) -> String {
            self.texts
                .lock()
                .last()
                .map(|(text, _)| text.clone())
                .unwrap_or_default()
        }

        fn saw_text(&self, needle: &str) -> bool {
            self.texts.lock().iter().any(|(text, _)| text.contains(needle))
        }
    }

    #[async_trait]
    impl DeliveryChannel for RecordingDelivery {
        async fn send_text(&self, _user_id: i64, text: &str, menu: Option<&Menu>) -> Result<()> {
            self.texts.lock().push((text.to_string(), menu.cloned()));
            Ok(())
        }

        async fn send_image(
            &self,
            _user_id: i64,
            image: &PreparedImage,
            _caption: &str,
            _menu: Option<&Menu>,
        ) -> Result<()> {
            if self.fail_images.load(Ordering::SeqCst) {
                return Err(anyhow!("transport rejected the photo"));
            }
            self.images.lock().push(image.clone());
            Ok(())
        }
    }

    struct SwitchGate {
        open: AtomicBool,
        checks: AtomicUsize,
    }

    #[async_trait]
    impl EligibilityGate for SwitchGate {
        async fn is_eligible(&self, _user_id: i64) -> bool {
            self.checks.fetch_add(1, Ordering::SeqCst);
            self.open.load(Ordering::SeqCst)
        }

        fn remediation_url(&self) -> Option<String> {
            Some("https://t.me/required".to_string())
        }
    }

    struct Harness {
        controller: FlowController,
        db: Database,
        sessions: Arc<InMemorySessionStore>,
        generator: Arc<ScriptedGenerator>,
        delivery: Arc<RecordingDelivery>,
        gate: Arc<SwitchGate>,
    }

    impl Harness {
        async fn new(starting_balance: i64, results: Vec<GenerationResult>) -> Self {
            let db = Database::init("sqlite::memory:", starting_balance)
                .await
                .unwrap();
            let sessions = Arc::new(InMemorySessionStore::default());
            let generator = Arc::new(ScriptedGenerator::new(results));
            let delivery = Arc::new(RecordingDelivery::default());
            let gate = Arc::new(SwitchGate {
                open: AtomicBool::new(true),
                checks: AtomicUsize::new(0),
            });
            let controller = FlowController::new(
                FlowDeps {
                    accounts: Arc::new(db.clone()),
                    sessions: sessions.clone(),
                    gate: gate.clone(),
                    generator: generator.clone(),
                    delivery: delivery.clone(),
                },
                FlowSettings {
                    catalog: ModelCatalog::new(vec![ImageModel::new("m", "M", "vendor/m", 10)]),
                    encoding: EncodingPolicy::default(),
                    prompts_channel_url: None,
                },
            );
            Self {
                controller,
                db,
                sessions,
                generator,
                delivery,
                gate,
            }
        }

        async fn send(&self, event: FlowEvent) -> Option<GenerationJob> {
            self.controller.handle(USER, event).await.unwrap()
        }

        async fn intent(&self, intent: Intent) -> Option<GenerationJob> {
            self.send(FlowEvent::Intent(intent)).await
        }

        async fn walk_to_prompt(&self, mode: Mode) {
            self.send(FlowEvent::Start).await;
            self.intent(Intent::OpenGenerate).await;
            self.intent(Intent::PickModel("m".to_string())).await;
            self.intent(Intent::PickMode(mode)).await;
            self.intent(Intent::PickFormat(AspectFormat::Square)).await;
        }

        fn state(&self) -> FlowState {
            self.sessions.get(USER).state
        }

        async fn balance(&self) -> i64 {
            self.db.get(USER).await.unwrap().unwrap().balance
        }
    }

    fn success() -> GenerationResult {
        GenerationResult::Success {
            image_bytes: png_bytes(),
        }
    }

    fn failure() -> GenerationResult {
        GenerationResult::Failure {
            reason: GenerationFailure::Provider {
                status: 500,
                detail: "secret upstream detail".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn exact_balance_buys_one_image() {
        let h = Harness::new(10, vec![success()]).await;
        h.walk_to_prompt(Mode::TextOnly).await;
        assert_eq!(h.state(), FlowState::AwaitingPrompt { source_image: None });

        let job = h.send(FlowEvent::Text("a red cat".into())).await.unwrap();
        assert_eq!(h.state(), FlowState::Generating);
        job.run().await;

        assert_eq!(h.delivery.images.lock().len(), 1);
        assert_eq!(h.delivery.images.lock()[0].mode, DeliveryMode::InlinePhoto);
        assert_eq!(h.balance().await, 0);
        assert_eq!(h.state(), FlowState::PostGeneration);
        let requests = h.generator.requests.lock();
        assert_eq!(requests[0].prompt, "a red cat");
        assert_eq!(requests[0].model, "vendor/m");
        assert_eq!(requests[0].format, AspectFormat::Square);
    }

    #[tokio::test]
    async fn insufficient_funds_skip_the_provider() {
        let h = Harness::new(5, vec![success()]).await;
        h.walk_to_prompt(Mode::TextOnly).await;

        let job = h.send(FlowEvent::Text("a red cat".into())).await;
        assert!(job.is_none());
        assert_eq!(h.generator.calls(), 0);
        assert!(h.delivery.last_text().starts_with("Not enough credits"));
        assert_eq!(h.state(), FlowState::Idle);
        assert_eq!(h.balance().await, 5);
    }

    #[tokio::test]
    async fn text_while_awaiting_image_is_rejected() {
        let h = Harness::new(50, vec![success()]).await;
        h.walk_to_prompt(Mode::ImagePlusText).await;
        assert_eq!(h.state(), FlowState::AwaitingImage);

        assert!(h.send(FlowEvent::Text("hello".into())).await.is_none());
        assert_eq!(h.delivery.last_text(), screens::EXPECTED_PHOTO_TEXT);
        assert_eq!(h.state(), FlowState::AwaitingImage);

        h.send(FlowEvent::Photo {
            bytes: b"definitely not an image".to_vec(),
            caption: None,
        })
        .await;
        assert_eq!(h.delivery.last_text(), screens::INVALID_IMAGE_TEXT);
        assert_eq!(h.state(), FlowState::AwaitingImage);
    }

    #[tokio::test]
    async fn ineligible_user_gets_remediation_then_recheck_passes() {
        let h = Harness::new(50, vec![success()]).await;
        h.gate.open.store(false, Ordering::SeqCst);
        h.send(FlowEvent::Start).await;
        h.intent(Intent::OpenGenerate).await;

        assert_eq!(h.state(), FlowState::Idle);
        let (text, menu) = h.delivery.texts.lock().last().cloned().unwrap();
        assert_eq!(text, screens::REMEDIATION_TEXT);
        assert!(menu
            .unwrap()
            .intents()
            .any(|intent| *intent == Intent::CheckSubscription));

        h.gate.open.store(true, Ordering::SeqCst);
        h.intent(Intent::CheckSubscription).await;
        assert_eq!(h.state(), FlowState::ChoosingModel);
    }

    #[tokio::test]
    async fn gate_is_checked_again_at_submission() {
        let h = Harness::new(50, vec![success()]).await;
        h.walk_to_prompt(Mode::TextOnly).await;
        h.gate.open.store(false, Ordering::SeqCst);

        assert!(h.send(FlowEvent::Text("a red cat".into())).await.is_none());
        assert_eq!(h.generator.calls(), 0);
        assert_eq!(h.delivery.last_text(), screens::REMEDIATION_TEXT);
        assert_eq!(h.balance().await, 50);
    }

    #[tokio::test]
    async fn provider_failure_is_never_charged() {
        let h = Harness::new(50, vec![failure()]).await;
        h.walk_to_prompt(Mode::TextOnly).await;

        let job = h.send(FlowEvent::Text("a red cat".into())).await.unwrap();
        job.run().await;

        assert_eq!(h.balance().await, 50);
        assert_eq!(h.delivery.last_text(), screens::GENERATION_FAILED_TEXT);
        assert!(!h.delivery.saw_text("secret upstream detail"));
        assert_eq!(h.state(), FlowState::Idle);
        assert_eq!(h.db.stats().await.unwrap().generations, 0);
    }

    #[tokio::test]
    async fn only_awaiting_image_wants_a_photo() {
        let h = Harness::new(50, vec![success()]).await;
        assert!(!h.controller.wants_photo(USER));

        h.walk_to_prompt(Mode::ImagePlusText).await;
        assert_eq!(h.state(), FlowState::AwaitingImage);
        assert!(h.controller.wants_photo(USER));

        h.send(FlowEvent::Photo {
            bytes: png_bytes(),
            caption: None,
        })
        .await;
        assert!(!h.controller.wants_photo(USER));
    }

    #[tokio::test]
    async fn non_image_payload_is_never_charged() {
        let garbage = GenerationResult::Success {
            image_bytes: b"<html>403</html>".to_vec(),
        };
        let h = Harness::new(10, vec![garbage]).await;
        h.walk_to_prompt(Mode::TextOnly).await;

        let job = h.send(FlowEvent::Text("a red cat".into())).await.unwrap();
        job.run().await;

        assert_eq!(h.balance().await, 10);
        assert!(h.delivery.images.lock().is_empty());
        assert_eq!(h.delivery.last_text(), screens::GENERATION_FAILED_TEXT);
        assert_eq!(h.state(), FlowState::Idle);
        assert_eq!(h.db.stats().await.unwrap().generations, 0);
    }

    #[tokio::test]
    async fn delivery_failure_is_never_charged() {
        let h = Harness::new(50, vec![success()]).await;
        h.delivery.fail_images.store(true, Ordering::SeqCst);
        h.walk_to_prompt(Mode::TextOnly).await;

        let job = h.send(FlowEvent::Text("a red cat".into())).await.unwrap();
        job.run().await;

        assert_eq!(h.balance().await, 50);
        assert_eq!(h.delivery.last_text(), screens::DELIVERY_FAILED_TEXT);
        assert_eq!(h.state(), FlowState::Idle);
    }

    #[tokio::test]
    async fn charges_only_for_delivered_images() {
        let h = Harness::new(30, vec![success(), failure(), success()]).await;
        h.walk_to_prompt(Mode::TextOnly).await;

        h.send(FlowEvent::Text("a red cat".into()))
            .await
            .unwrap()
            .run()
            .await;
        assert_eq!(h.balance().await, 20);

        h.intent(Intent::Regenerate).await.unwrap().run().await;
        assert_eq!(h.balance().await, 20);
        assert_eq!(h.state(), FlowState::PostGeneration);

        h.intent(Intent::Regenerate).await.unwrap().run().await;
        assert_eq!(h.balance().await, 10);
        assert_eq!(h.delivery.images.lock().len(), 2);
        assert_eq!(h.generator.calls(), 3);
        assert!(h
            .generator
            .requests
            .lock()
            .iter()
            .all(|request| request.prompt == "a red cat"));
    }

    #[tokio::test]
    async fn triggers_during_generation_are_dropped() {
        let h = Harness::new(50, vec![success()]).await;
        h.walk_to_prompt(Mode::TextOnly).await;
        let job = h.send(FlowEvent::Text("a red cat".into())).await.unwrap();

        assert!(h.send(FlowEvent::Text("another".into())).await.is_none());
        assert_eq!(h.delivery.last_text(), screens::BUSY_TEXT);

        // Leaving through the main menu does not free the in-flight slot.
        h.intent(Intent::MainMenu).await;
        h.walk_to_prompt(Mode::TextOnly).await;
        assert!(h.send(FlowEvent::Text("third".into())).await.is_none());
        assert_eq!(h.delivery.last_text(), screens::BUSY_TEXT);

        job.run().await;
        assert_eq!(h.generator.calls(), 1);
        assert_eq!(h.balance().await, 40);
        // The user had navigated away, so the finished job leaves their screen alone.
        assert_eq!(h.state(), FlowState::AwaitingPrompt { source_image: None });

        let job = h.send(FlowEvent::Text("third".into())).await;
        assert!(job.is_some());
    }

    #[tokio::test]
    async fn photo_then_prompt_carries_the_source_image() {
        let h = Harness::new(50, vec![success()]).await;
        h.walk_to_prompt(Mode::ImagePlusText).await;
        let photo = png_bytes();

        h.send(FlowEvent::Photo {
            bytes: photo.clone(),
            caption: None,
        })
        .await;
        assert!(matches!(
            h.state(),
            FlowState::AwaitingPrompt {
                source_image: Some(_)
            }
        ));

        h.send(FlowEvent::Photo {
            bytes: photo.clone(),
            caption: None,
        })
        .await;
        assert_eq!(h.delivery.last_text(), screens::EXPECTED_TEXT_TEXT);

        h.send(FlowEvent::Text("make it blue".into()))
            .await
            .unwrap()
            .run()
            .await;
        let requests = h.generator.requests.lock();
        assert_eq!(requests[0].source_image.as_deref(), Some(&photo));

        let last = h.sessions.get(USER).last.unwrap();
        assert_eq!(last.prompt, "make it blue");
        assert!(last.source_image.is_some());
    }

    #[tokio::test]
    async fn captioned_photo_starts_generation_directly() {
        let h = Harness::new(50, vec![success()]).await;
        h.walk_to_prompt(Mode::ImagePlusText).await;

        let job = h
            .send(FlowEvent::Photo {
                bytes: png_bytes(),
                caption: Some("  watercolor style ".into()),
            })
            .await
            .unwrap();
        job.run().await;
        assert_eq!(h.generator.requests.lock()[0].prompt, "watercolor style");
        assert_eq!(h.balance().await, 40);
    }

    #[tokio::test]
    async fn edit_prompt_keeps_the_previous_image() {
        let h = Harness::new(50, vec![success()]).await;
        h.walk_to_prompt(Mode::ImagePlusText).await;
        h.send(FlowEvent::Photo {
            bytes: png_bytes(),
            caption: Some("first".into()),
        })
        .await
        .unwrap()
        .run()
        .await;

        h.intent(Intent::EditPrompt).await;
        assert!(matches!(
            h.state(),
            FlowState::AwaitingPrompt {
                source_image: Some(_)
            }
        ));
        h.send(FlowEvent::Text("second".into()))
            .await
            .unwrap()
            .run()
            .await;
        let requests = h.generator.requests.lock();
        assert_eq!(requests[1].prompt, "second");
        assert!(requests[1].source_image.is_some());
    }

    #[tokio::test]
    async fn stale_buttons_are_ignored() {
        let h = Harness::new(50, vec![success()]).await;
        h.send(FlowEvent::Start).await;

        h.intent(Intent::PickModel("m".into())).await;
        assert_eq!(h.delivery.last_text(), screens::STALE_MENU_TEXT);
        assert_eq!(h.state(), FlowState::Idle);

        h.intent(Intent::Regenerate).await;
        assert_eq!(h.state(), FlowState::Idle);
        assert_eq!(h.generator.calls(), 0);

        h.intent(Intent::OpenGenerate).await;
        h.intent(Intent::PickModel("unknown".into())).await;
        assert_eq!(h.state(), FlowState::ChoosingModel);
    }

    #[tokio::test]
    async fn free_text_outside_prompt_gets_a_hint() {
        let h = Harness::new(50, vec![success()]).await;
        h.send(FlowEvent::Start).await;
        assert!(h.send(FlowEvent::Text("a red cat".into())).await.is_none());
        assert_eq!(h.delivery.last_text(), screens::USE_BUTTONS_TEXT);
        assert_eq!(h.generator.calls(), 0);

        h.send(FlowEvent::Unsupported).await;
        assert_eq!(h.state(), FlowState::Idle);
    }

    #[tokio::test]
    async fn selections_are_persisted_on_the_account() {
        let h = Harness::new(50, vec![success()]).await;
        h.send(FlowEvent::Start).await;
        h.intent(Intent::OpenGenerate).await;
        h.intent(Intent::PickModel("m".into())).await;
        h.intent(Intent::PickMode(Mode::TextOnly)).await;
        h.intent(Intent::PickFormat(AspectFormat::Wide)).await;

        let account = h.db.get(USER).await.unwrap().unwrap();
        assert_eq!(account.selected_model.as_deref(), Some("m"));
        assert_eq!(account.selected_format, AspectFormat::Wide);
        assert!(h.gate.checks.load(Ordering::SeqCst) >= 2);
    }
}
