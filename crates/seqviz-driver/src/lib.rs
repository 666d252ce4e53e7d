#![forbid(unsafe_code)]
//! Asynchronous workflow drivers.
//!
//! Each workflow builds its step list, starts a sequence on the shared
//! [`ControllerHandle`] and then walks it with timed pauses, consulting the
//! [`Shop`] at synchronization points. Every controller call carries the
//! identity returned by `start`, so a driver that was superseded keeps running
//! its timers harmlessly: all of its later calls are dropped as stale.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use seqviz_core::{ControllerHandle, Mutation, Payload, SequenceId, SequenceOutcome, Step};
use seqviz_shop::{Category, Product, Shop, User};
use seqviz_telemetry::{TelemetryEvent, TelemetrySink, TelemetryStatus};
use serde::Serialize;
use serde_json::json;
use time::OffsetDateTime;

mod catalog;

pub use catalog::INSIGHT_PREFIX;

use catalog::{payload, token};

pub type SharedShop = Arc<Mutex<Shop>>;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("unknown product: {0}")]
    UnknownProduct(String),
    #[error("{operation} join failure: {message}")]
    Join {
        operation: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DriverConfig {
    pub step_delay: Duration,
    pub loop_delay: Duration,
    pub telemetry_enabled: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            step_delay: Duration::from_millis(300),
            loop_delay: Duration::from_millis(3500),
            telemetry_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AuthMode {
    Login,
    Signup,
}

impl AuthMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Signup => "signup",
        }
    }

    #[must_use]
    pub fn kind(self) -> &'static str {
        match self {
            Self::Login => "auth_login",
            Self::Signup => "auth_signup",
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Credentials {
    pub email: String,
    pub password: String,
    /// Display name; only read on signup.
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CartAction {
    Add,
    Remove,
}

impl CartAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
        }
    }
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct PurchaseReceipt {
    pub product_id: String,
    pub subtotal: u32,
    pub tax: String,
    pub intent_id: String,
    pub order_uuid: String,
}

/// What a single workflow run did.
///
/// `archived` is false when the run was superseded (or reset) before it
/// reached a terminal state, in which case nothing was recorded in history.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowReport<T> {
    pub sequence_id: SequenceId,
    pub kind: &'static str,
    pub outcome: SequenceOutcome,
    pub archived: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub value: Option<T>,
}

impl<T> WorkflowReport<T> {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Clone)]
pub struct WorkflowDriver {
    controller: ControllerHandle,
    shop: SharedShop,
    telemetry: Arc<dyn TelemetrySink>,
    config: DriverConfig,
}

impl std::fmt::Debug for WorkflowDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowDriver")
            .field("telemetry", &self.telemetry.sink_name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl WorkflowDriver {
    #[must_use]
    pub fn new(
        controller: ControllerHandle,
        shop: SharedShop,
        telemetry: Arc<dyn TelemetrySink>,
        config: DriverConfig,
    ) -> Self {
        Self {
            controller,
            shop,
            telemetry,
            config,
        }
    }

    #[must_use]
    pub fn controller(&self) -> &ControllerHandle {
        &self.controller
    }

    #[must_use]
    pub fn shop(&self) -> &SharedShop {
        &self.shop
    }

    #[must_use]
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Abandon whatever is running without recording it.
    pub fn abandon(&self) -> Option<SequenceId> {
        self.controller.reset()
    }

    /// Sign in or register, deciding the branch at the profile lookup step.
    ///
    /// # Errors
    /// Returns [`DriverError::Join`] if a blocking shop call panics.
    pub async fn run_auth(
        &self,
        mode: AuthMode,
        credentials: Credentials,
    ) -> Result<WorkflowReport<User>, DriverError> {
        let mut run = self.begin(mode.kind(), catalog::auth_steps(mode, &credentials.email));

        for _ in 0..4 {
            run.pause().await;
            run.complete(None).await;
        }
        run.pause().await;

        let result = self
            .on_shop("auth", move |shop| {
                shop.refresh();
                match mode {
                    AuthMode::Login => shop.login(&credentials.email, &credentials.password),
                    AuthMode::Signup => shop.register(
                        &credentials.email,
                        &credentials.password,
                        credentials.name.as_deref().unwrap_or_default(),
                    ),
                }
            })
            .await?;

        match result {
            Ok(user) => {
                run.complete(Some(payload(json!({
                    "index": "idx_email_uniq",
                    "lock": "SHARED",
                    "status": "FOUND",
                }))))
                .await;
                run.pause().await;
                run.complete(Some(payload(json!({
                    "session_id": token("sess_", 6),
                    "rotation": "EdDSA",
                }))))
                .await;
                run.pause().await;
                run.complete(Some(payload(json!({
                    "status": "AUTHORIZED",
                    "welcome": format!("Welcome, {}!", user.name),
                }))))
                .await;
                Ok(run.finish(Ok(user)))
            }
            Err(err) => {
                let message = err.to_string();
                run.fail(
                    Some(payload(json!({
                        "index": "idx_email_uniq",
                        "lock": "SHARED",
                        "error": message,
                    }))),
                    &message,
                )
                .await;
                Ok(run.finish(Err(message)))
            }
        }
    }

    /// # Errors
    /// Returns [`DriverError::Join`] if a blocking shop call panics.
    pub async fn run_search(&self, query: &str) -> Result<WorkflowReport<Vec<Product>>, DriverError> {
        let mut run = self.begin("search", catalog::search_steps(query));

        for _ in 0..4 {
            run.pause().await;
            run.complete(None).await;
        }

        run.pause().await;
        let needle = query.to_string();
        let results = self
            .on_shop("search", move |shop| shop.search_products(&needle))
            .await?;
        let ids: Vec<&str> = results.iter().take(5).map(|product| product.id.as_str()).collect();
        run.complete(Some(payload(json!({
            "rows_returned": results.len(),
            "ids": ids,
            "latency": "14ms",
        }))))
        .await;

        run.pause().await;
        let top = results
            .first()
            .map_or_else(|| "N/A".to_string(), |product| product.name.clone());
        run.complete(Some(payload(json!({ "top_relevance": top }))))
            .await;

        run.pause().await;
        run.complete(Some(payload(json!({ "telemetry_id": token("tel_", 6) }))))
            .await;

        Ok(run.finish(Ok(results)))
    }

    /// Buy one unit of `product_id`, failing at the stock check when none is left.
    ///
    /// # Errors
    /// Returns [`DriverError::UnknownProduct`] before any sequence starts when
    /// the id is not in the catalog, or [`DriverError::Join`] if a blocking
    /// shop call panics.
    pub async fn run_purchase(
        &self,
        product_id: &str,
    ) -> Result<WorkflowReport<PurchaseReceipt>, DriverError> {
        let lookup_id = product_id.to_string();
        let product = self
            .on_shop("purchase lookup", move |shop| shop.get_product(&lookup_id).cloned())
            .await?
            .ok_or_else(|| DriverError::UnknownProduct(product_id.to_string()))?;

        let mut run = self.begin("purchase", catalog::purchase_steps(&product));

        run.pause().await;
        run.complete(None).await;

        let refresh_id = product_id.to_string();
        let fresh = self
            .on_shop("purchase refresh", move |shop| {
                shop.refresh();
                shop.get_product(&refresh_id).cloned()
            })
            .await?;
        let Some(fresh) = fresh else {
            run.fail(None, "Product Data Corruption").await;
            return Ok(run.finish(Err("Product Data Corruption".to_string())));
        };

        run.pause().await;
        if fresh.stock == 0 {
            run.fail(
                Some(payload(json!({
                    "status": "OUT_OF_STOCK",
                    "remaining": 0,
                    "error": "INSUFFICIENT_QUANTITY",
                }))),
                "INSUFFICIENT_STOCK_DETECTION",
            )
            .await;
            return Ok(run.finish(Err("Out of stock".to_string())));
        }
        run.complete(Some(payload(json!({
            "status": "IN_STOCK",
            "remaining": fresh.stock,
        }))))
        .await;

        run.pause().await;
        let tax = format!("{:.2}", f64::from(product.price) * 0.15);
        run.complete(Some(payload(json!({
            "subtotal": product.price,
            "tax": tax,
        }))))
        .await;

        run.pause().await;
        let intent_id = token("pi_", 8);
        run.complete(Some(payload(json!({ "intent_id": intent_id }))))
            .await;

        run.pause().await;
        run.complete(None).await;

        run.pause().await;
        run.complete(Some(payload(json!({ "response": "CONFIRMED" }))))
            .await;

        run.pause().await;
        let order_uuid = ulid::Ulid::new().to_string().to_ascii_lowercase();
        run.complete(Some(payload(json!({ "order_uuid": order_uuid }))))
            .await;

        run.pause().await;
        run.complete(Some(payload(json!({ "email": "sent" }))))
            .await;

        Ok(run.finish(Ok(PurchaseReceipt {
            product_id: product.id,
            subtotal: product.price,
            tax,
            intent_id,
            order_uuid,
        })))
    }

    /// Add or remove `product`, mutating the cart at the backend sync step.
    /// The value is the cart's item count afterwards.
    ///
    /// # Errors
    /// Returns [`DriverError::Join`] if a blocking shop call panics.
    pub async fn run_cart(
        &self,
        action: CartAction,
        product: Product,
    ) -> Result<WorkflowReport<u32>, DriverError> {
        let mut run = self.begin("cart", catalog::cart_steps(action, &product));

        run.pause().await;
        run.complete(None).await;
        run.pause().await;
        run.complete(None).await;

        run.pause().await;
        self.on_shop("cart mutate", move |shop| match action {
            CartAction::Add => shop.add_to_cart(&product),
            CartAction::Remove => shop.remove_from_cart(&product.id),
        })
        .await?;
        run.complete(Some(payload(json!({ "server_synced": true }))))
            .await;

        run.pause().await;
        run.complete(Some(payload(json!({ "reco_count": 3 })))).await;

        run.pause().await;
        let count = self.on_shop("cart count", |shop| shop.cart_count()).await?;
        run.complete(Some(payload(json!({
            "re_render": true,
            "new_count": count,
        }))))
        .await;

        Ok(run.finish(Ok(count)))
    }

    /// # Errors
    /// Returns [`DriverError::Join`] if a blocking shop call panics.
    pub async fn run_filter(
        &self,
        category: Category,
    ) -> Result<WorkflowReport<Vec<Product>>, DriverError> {
        let mut run = self.begin("search", catalog::filter_steps(category));

        run.pause().await;
        run.complete(None).await;
        run.pause().await;
        let mut products = self
            .on_shop("filter", move |shop| shop.products_in(category))
            .await?;
        products.sort_by_key(|product| product.price);
        run.complete(None).await;
        run.pause().await;
        run.complete(None).await;

        Ok(run.finish(Ok(products)))
    }

    /// # Errors
    /// Returns [`DriverError::Join`] if a blocking shop call panics.
    pub async fn run_logout(&self) -> Result<WorkflowReport<()>, DriverError> {
        let mut run = self.begin("auth_login", catalog::logout_steps(OffsetDateTime::now_utc()));

        run.pause().await;
        run.complete(None).await;
        run.pause().await;
        run.complete(None).await;

        self.on_shop("logout", Shop::logout).await?;

        for _ in 0..3 {
            run.pause().await;
            run.complete(None).await;
        }

        Ok(run.finish(Ok(())))
    }

    fn begin(&self, kind: &'static str, steps: Vec<Step>) -> Run<'_> {
        let id = self.controller.start(kind, steps.clone());
        tracing::info!(sequence_id = %id, kind, steps = steps.len(), "workflow started");
        Run {
            driver: self,
            id,
            kind,
            steps,
            position: 0,
            last: Mutation::Applied,
        }
    }

    async fn on_shop<T, F>(&self, operation: &'static str, op: F) -> Result<T, DriverError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Shop) -> T + Send + 'static,
    {
        let shop = Arc::clone(&self.shop);
        tokio::task::spawn_blocking(move || op(&mut shop.lock()))
            .await
            .map_err(|err| DriverError::Join {
                operation,
                message: err.to_string(),
            })
    }

    /// Best-effort delivery; failures are logged and dropped.
    async fn report(&self, step: &Step, status: TelemetryStatus, observed: Option<Payload>) {
        if !self.config.telemetry_enabled {
            return;
        }
        let mut event = TelemetryEvent::from_step(step, status);
        if let Some(observed) = observed {
            event = event.with_payload(observed);
        }
        let sink = Arc::clone(&self.telemetry);
        let sink_name = sink.sink_name();
        match tokio::task::spawn_blocking(move || sink.record(&event)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(sink = sink_name, error = %err, "telemetry delivery failed");
            }
            Err(err) => {
                tracing::warn!(sink = sink_name, error = %err, "telemetry task failed");
            }
        }
    }
}

/// One in-flight walk over an authored step list.
struct Run<'a> {
    driver: &'a WorkflowDriver,
    id: SequenceId,
    kind: &'static str,
    steps: Vec<Step>,
    position: usize,
    last: Mutation,
}

impl Run<'_> {
    async fn pause(&self) {
        tokio::time::sleep(self.driver.config.step_delay).await;
    }

    /// Report, complete and advance past the current step.
    async fn complete(&mut self, observed: Option<Payload>) {
        if let Some(step) = self.steps.get(self.position) {
            self.driver
                .report(step, TelemetryStatus::Success, observed.clone())
                .await;
        }
        let completed = self.driver.controller.complete_active(self.id, observed);
        let advanced = self.driver.controller.advance(self.id);
        self.last = if completed.is_applied() && advanced.is_applied() {
            Mutation::Applied
        } else {
            Mutation::Stale
        };
        self.position += 1;
    }

    async fn fail(&mut self, observed: Option<Payload>, message: &str) {
        if let Some(step) = self.steps.get(self.position) {
            self.driver
                .report(step, TelemetryStatus::Error, observed)
                .await;
        }
        self.last = self.driver.controller.fail_active(self.id, Some(message));
    }

    fn finish<T>(self, value: Result<T, String>) -> WorkflowReport<T> {
        let archived = self.last.is_applied();
        let (outcome, error, value) = match value {
            Ok(value) => (SequenceOutcome::Completed, None, Some(value)),
            Err(message) => (SequenceOutcome::Failed, Some(message), None),
        };
        if archived {
            tracing::info!(sequence_id = %self.id, kind = self.kind, outcome = outcome.as_str(), "workflow finished");
        } else {
            tracing::debug!(sequence_id = %self.id, kind = self.kind, "workflow superseded before finishing");
        }
        WorkflowReport {
            sequence_id: self.id,
            kind: self.kind,
            outcome,
            archived,
            error,
            value,
        }
    }
}

/// Shared on/off switch for repeated runs. Stopping never cancels a run in
/// progress; the loop simply does not re-enter.
#[derive(Debug, Clone, Default)]
pub struct LoopControl {
    looping: Arc<AtomicBool>,
}

impl LoopControl {
    #[must_use]
    pub fn new(looping: bool) -> Self {
        Self {
            looping: Arc::new(AtomicBool::new(looping)),
        }
    }

    #[must_use]
    pub fn is_looping(&self) -> bool {
        self.looping.load(Ordering::SeqCst)
    }

    pub fn set_looping(&self, looping: bool) {
        self.looping.store(looping, Ordering::SeqCst);
    }

    /// Flip the flag and return the new value.
    pub fn toggle(&self) -> bool {
        !self.looping.fetch_xor(true, Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct LoopRunner {
    control: LoopControl,
    loop_delay: Duration,
}

impl LoopRunner {
    #[must_use]
    pub fn new(control: LoopControl, loop_delay: Duration) -> Self {
        Self {
            control,
            loop_delay,
        }
    }

    #[must_use]
    pub fn control(&self) -> &LoopControl {
        &self.control
    }

    /// Run `workflow` once, then again after each `loop_delay` for as long as
    /// the control flag stays set. Returns how many runs were made.
    ///
    /// # Errors
    /// Propagates the first error returned by `workflow`.
    pub async fn run<F, Fut>(
        &self,
        max_iterations: Option<usize>,
        mut workflow: F,
    ) -> Result<usize, DriverError>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<(), DriverError>>,
    {
        let mut iterations = 0;
        loop {
            workflow(iterations).await?;
            iterations += 1;
            if max_iterations.is_some_and(|max| iterations >= max) || !self.control.is_looping() {
                break;
            }
            tokio::time::sleep(self.loop_delay).await;
            if !self.control.is_looping() {
                break;
            }
            tracing::debug!(iteration = iterations, "loop re-entering");
        }
        Ok(iterations)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;
    use seqviz_core::{ControllerConfig, ControllerHandle, SequenceOutcome, StepStatus};
    use seqviz_shop::{Category, MemoryDocumentStore, Shop, DEMO_EMAIL, DEMO_PASSWORD};
    use seqviz_telemetry::{RecordingTelemetrySink, TelemetrySink, TelemetryStatus};
    use serde_json::json;

    use super::{
        AuthMode, CartAction, Credentials, DriverConfig, DriverError, LoopControl, LoopRunner,
        WorkflowDriver,
    };

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_driver(sink: Arc<RecordingTelemetrySink>) -> WorkflowDriver {
        let shop = Shop::open(Box::new(MemoryDocumentStore::new()));
        let telemetry: Arc<dyn TelemetrySink> = sink;
        WorkflowDriver::new(
            ControllerHandle::new(&ControllerConfig::default()),
            Arc::new(Mutex::new(shop)),
            telemetry,
            DriverConfig::default(),
        )
    }

    fn demo_credentials(password: &str) -> Credentials {
        Credentials {
            email: DEMO_EMAIL.to_string(),
            password: password.to_string(),
            name: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn login_success_archives_completed_run() {
        let sink = Arc::new(RecordingTelemetrySink::new());
        let driver = fixture_driver(Arc::clone(&sink));

        let report = must_ok(
            driver
                .run_auth(AuthMode::Login, demo_credentials(DEMO_PASSWORD))
                .await,
        );
        assert!(report.is_success());
        assert!(report.archived);
        assert_eq!(report.kind, "auth_login");
        assert_eq!(report.value.map(|user| user.email), Some(DEMO_EMAIL.to_string()));

        let snapshot = driver.controller().snapshot();
        assert!(!snapshot.running);
        let entry = &snapshot.history[0];
        assert_eq!(entry.outcome, SequenceOutcome::Completed);
        assert_eq!(entry.steps.len(), 7);
        assert!(entry
            .steps
            .iter()
            .all(|step| step.status == StepStatus::Completed));
        let profile = entry.steps[4].payload.as_ref().and_then(|p| p.get("status"));
        assert_eq!(profile, Some(&json!("FOUND")));
        let welcome = entry.steps[6].payload.as_ref().and_then(|p| p.get("welcome"));
        assert_eq!(welcome, Some(&json!("Welcome, Demo User!")));

        assert_eq!(sink.events().len(), 7);
        assert!(driver.shop().lock().session().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn login_with_wrong_password_fails_at_profile_lookup() {
        let sink = Arc::new(RecordingTelemetrySink::new());
        let driver = fixture_driver(Arc::clone(&sink));

        let report = must_ok(
            driver
                .run_auth(AuthMode::Login, demo_credentials("nope"))
                .await,
        );
        assert_eq!(report.error.as_deref(), Some("Invalid password"));
        assert_eq!(report.outcome, SequenceOutcome::Failed);
        assert!(report.archived);

        let history = driver.controller().snapshot().history;
        let entry = &history[0];
        assert_eq!(entry.outcome, SequenceOutcome::Failed);
        assert_eq!(entry.steps[4].status, StepStatus::Error);
        assert_eq!(
            entry.steps[4].payload.as_ref().and_then(|p| p.get("error")),
            Some(&json!("Invalid password"))
        );
        assert_eq!(entry.steps[5].status, StepStatus::Pending);
        assert_eq!(entry.steps[6].status, StepStatus::Pending);

        let events = sink.events();
        assert_eq!(events.len(), 5);
        assert_eq!(events[4].status, TelemetryStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn signup_with_taken_email_fails() {
        let driver = fixture_driver(Arc::new(RecordingTelemetrySink::new()));
        let credentials = Credentials {
            name: Some("Dup".to_string()),
            ..demo_credentials("pw")
        };
        let report = must_ok(driver.run_auth(AuthMode::Signup, credentials).await);
        assert_eq!(report.kind, "auth_signup");
        assert_eq!(report.error.as_deref(), Some("Email already exists"));
    }

    #[tokio::test(start_paused = true)]
    async fn search_patches_execution_time_payloads() {
        let driver = fixture_driver(Arc::new(RecordingTelemetrySink::new()));
        let report = must_ok(driver.run_search("neuralphone").await);
        assert_eq!(report.value.as_ref().map(Vec::len), Some(15));

        let history = driver.controller().snapshot().history;
        let steps = &history[0].steps;
        let db = steps[4].payload.as_ref().unwrap_or_else(|| unreachable!());
        assert_eq!(db.get("rows_returned"), Some(&json!(15)));
        assert_eq!(db.get("ts_query"), Some(&json!("neuralphone")));
        assert_eq!(
            steps[5].payload.as_ref().and_then(|p| p.get("top_relevance")),
            Some(&json!("NeuralPhone X1"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn purchase_branches_on_stock() {
        let driver = fixture_driver(Arc::new(RecordingTelemetrySink::new()));

        let sold_out = must_ok(driver.run_purchase("lap-1").await);
        assert_eq!(sold_out.outcome, SequenceOutcome::Failed);
        let history = driver.controller().snapshot().history;
        assert_eq!(history[0].steps[1].status, StepStatus::Error);
        assert_eq!(
            history[0].steps[1].payload.as_ref().and_then(|p| p.get("error")),
            Some(&json!("INSUFFICIENT_STOCK_DETECTION"))
        );

        let bought = must_ok(driver.run_purchase("mob-1").await);
        let receipt = bought.value.unwrap_or_else(|| unreachable!());
        assert_eq!(receipt.subtotal, 850);
        assert_eq!(receipt.tax, "127.50");
        assert!(receipt.intent_id.starts_with("pi_"));

        let history = driver.controller().snapshot().history;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].outcome, SequenceOutcome::Completed);
        assert_eq!(history[0].steps.len(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn purchase_restocked_elsewhere_is_seen_at_sync_point() {
        let driver = fixture_driver(Arc::new(RecordingTelemetrySink::new()));
        must_ok(driver.shop().lock().set_stock("lap-2", 3));
        let report = must_ok(driver.run_purchase("lap-2").await);
        assert!(report.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_product_never_starts_a_sequence() {
        let driver = fixture_driver(Arc::new(RecordingTelemetrySink::new()));
        let result = driver.run_purchase("nope").await;
        assert!(matches!(result, Err(DriverError::UnknownProduct(id)) if id == "nope"));
        assert!(driver.controller().snapshot().history.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cart_add_and_remove_report_new_count() {
        let driver = fixture_driver(Arc::new(RecordingTelemetrySink::new()));
        let product = driver
            .shop()
            .lock()
            .get_product("acc-1")
            .cloned()
            .unwrap_or_else(|| unreachable!());

        must_ok(driver.run_cart(CartAction::Add, product.clone()).await);
        let report = must_ok(driver.run_cart(CartAction::Add, product.clone()).await);
        assert_eq!(report.value, Some(2));
        let history = driver.controller().snapshot().history;
        assert_eq!(history[0].steps[0].action, "DISPATCH_CART_ADD");
        assert_eq!(
            history[0].steps[4].payload.as_ref().and_then(|p| p.get("new_count")),
            Some(&json!(2))
        );

        let report = must_ok(driver.run_cart(CartAction::Remove, product).await);
        assert_eq!(report.value, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn filter_returns_category_sorted_by_price() {
        let driver = fixture_driver(Arc::new(RecordingTelemetrySink::new()));
        let report = must_ok(driver.run_filter(Category::Accessories).await);
        let products = report.value.unwrap_or_default();
        assert_eq!(products.len(), 15);
        assert!(products.windows(2).all(|pair| pair[0].price <= pair[1].price));
        assert_eq!(report.kind, "search");
    }

    #[tokio::test(start_paused = true)]
    async fn logout_clears_session_even_without_telemetry() {
        let sink = Arc::new(RecordingTelemetrySink::unavailable());
        let driver = fixture_driver(sink);
        must_ok(driver.shop().lock().login(DEMO_EMAIL, DEMO_PASSWORD));

        let report = must_ok(driver.run_logout().await);
        assert!(report.archived);
        assert_eq!(report.outcome, SequenceOutcome::Completed);
        assert!(driver.shop().lock().session().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_driver_leaves_new_sequence_untouched() {
        let driver = fixture_driver(Arc::new(RecordingTelemetrySink::new()));

        let background = driver.clone();
        let search = tokio::spawn(async move { background.run_search("holo").await });

        tokio::time::sleep(Duration::from_millis(450)).await;
        let filter = must_ok(driver.run_filter(Category::Mobiles).await);
        assert!(filter.archived);

        let search = must_ok(must_ok(search.await));
        assert!(!search.archived);

        let history = driver.controller().snapshot().history;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].sequence_id, filter.sequence_id);
        assert_eq!(history[0].steps.len(), 3);
        assert!(history[0]
            .steps
            .iter()
            .all(|step| step.status == StepStatus::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn abandon_discards_without_history() {
        let driver = fixture_driver(Arc::new(RecordingTelemetrySink::new()));
        let background = driver.clone();
        let logout = tokio::spawn(async move { background.run_logout().await });

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(driver.abandon().is_some());

        let report = must_ok(must_ok(logout.await));
        assert!(!report.archived);
        assert!(driver.controller().snapshot().history.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn loop_runner_stops_when_flag_clears() {
        let driver = fixture_driver(Arc::new(RecordingTelemetrySink::new()));
        let control = LoopControl::new(true);
        let runner = LoopRunner::new(control.clone(), driver.config().loop_delay);

        let looped = driver.clone();
        let task = tokio::spawn(async move {
            runner
                .run(None, |_| {
                    let driver = looped.clone();
                    async move { driver.run_filter(Category::Laptops).await.map(|_| ()) }
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(5_000)).await;
        control.set_looping(false);

        let iterations = must_ok(must_ok(task.await));
        assert!(iterations >= 1);
        assert_eq!(driver.controller().snapshot().history.len(), iterations);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_runner_honours_iteration_cap() {
        let driver = fixture_driver(Arc::new(RecordingTelemetrySink::new()));
        let runner = LoopRunner::new(LoopControl::new(true), Duration::from_millis(10));
        let iterations = must_ok(
            runner
                .run(Some(3), |_| {
                    let driver = driver.clone();
                    async move { driver.run_logout().await.map(|_| ()) }
                })
                .await,
        );
        assert_eq!(iterations, 3);
        assert_eq!(driver.controller().snapshot().history.len(), 3);
    }

    #[test]
    fn loop_control_toggle_returns_new_state() {
        let control = LoopControl::default();
        assert!(!control.is_looping());
        assert!(control.toggle());
        assert!(control.is_looping());
        assert!(!control.toggle());
    }
}
