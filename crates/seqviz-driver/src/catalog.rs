//! Authored step lists for each workflow.

use seqviz_core::{Payload, Step};
use seqviz_shop::{Category, Product};
use serde_json::{json, Value};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::{AuthMode, CartAction};

pub const INSIGHT_PREFIX: &str = "✅ [DEPTH ANALYZED]:";

pub(crate) fn insight(context: &str) -> String {
    format!("{INSIGHT_PREFIX} {context}")
}

/// Object literal to [`Payload`]; anything else yields an empty payload.
pub(crate) fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

/// Random lowercase token such as `sess_k3v9x2`.
pub(crate) fn token(prefix: &str, len: usize) -> String {
    let raw = Ulid::new().to_string().to_ascii_lowercase();
    let start = raw.len().saturating_sub(len);
    format!("{prefix}{}", &raw[start..])
}

fn step(
    id: &str,
    label: &str,
    source: &str,
    action: impl Into<String>,
    body: Value,
    context: &str,
) -> Step {
    Step::new(id, label, source, action)
        .with_payload(payload(body))
        .with_explanation(insight(context))
}

pub(crate) fn auth_steps(mode: AuthMode, email: &str) -> Vec<Step> {
    vec![
        step(
            "1",
            "Rate Limiter",
            "Gateway",
            "CHECK_LIMITS",
            json!({"ip": "192.168.1.45", "bucket": "auth_global", "burst": 5}),
            "Verifying request frequency to prevent brute force attacks.",
        ),
        step(
            "2",
            "Sanitizer",
            "Server",
            "STRIP_XSS_SQLI",
            json!({"input": email, "strategy": "aggressive"}),
            "Cleaning input data to ensure no malicious scripts are injected.",
        ),
        step(
            "3",
            "API Gateway",
            "Server",
            format!("POST /api/v1/auth/{}", mode.as_str()),
            json!({"headers": {"X-Request-ID": "req_auth_921"}, "method": "POST"}),
            "Routing your request to the authentication microservice.",
        ),
        step(
            "4",
            "Security",
            "Auth Service",
            "BCRYPT_VERIFY",
            json!({"cost_factor": 12, "salt_detected": true}),
            "Securely comparing your credentials using high-entropy hashing.",
        ),
        step(
            "5",
            "Database",
            "DB",
            "FETCH_USER_PROFILE",
            json!({"index": "idx_email_unq", "lock": "SHARED"}),
            "Retrieving your account profile from the secure database.",
        ),
        step(
            "6",
            "Session Mgmt",
            "Server",
            "KEY_ROTATION",
            json!({"alg": "EdDSA", "kid": "rsa_pub_2024_03"}),
            "Generating a new rotated session key for your high-security JWT.",
        ),
        step(
            "7",
            "Response",
            "UI",
            "ACK_SUCCESS",
            json!({"status": "AUTHORIZED", "redirect_to": "/dashboard"}),
            "Handshake complete. Welcome back to BreakThru.",
        ),
    ]
}

pub(crate) fn search_steps(query: &str) -> Vec<Step> {
    let tokens: Vec<&str> = query.split(' ').collect();
    vec![
        step(
            "1",
            "DNS Lookup",
            "UI",
            "RESOLVE api.breakthru.dev",
            json!({"hostname": "api.breakthru.dev", "record": "A", "ttl": 3600}),
            "Resolving the service domain name to an IP address.",
        ),
        step(
            "2",
            "Load Balancer",
            "Server",
            "NGINX_ROUTING",
            json!({"upstream": "search_cluster_v3", "weight": 80, "health": "OK"}),
            "Distributing the search request to an available compute node.",
        ),
        step(
            "3",
            "Query Engine",
            "Server",
            "NLP_TOKENIZE",
            json!({"tokens": tokens, "lang": "en_US", "stop_words_removed": true}),
            "Processing your search query using natural language tokenization.",
        ),
        step(
            "4",
            "Cache Sync",
            "Server",
            "LRU_CACHE_CHECK",
            json!({"key": format!("q:{}", query.to_lowercase()), "namespace": "products"}),
            "Checking the high-speed cache for pre-computed search results.",
        ),
        step(
            "5",
            "Database",
            "DB",
            "FULL_TEXT_INDEX_QUERY",
            json!({"index": "gin_trgm_name", "ts_query": query, "limit": 50}),
            "Executing a weighted full-text search against the product catalog.",
        ),
        step(
            "6",
            "Ranker",
            "Server",
            "RELEVANCE_SCORING",
            json!({"model": "bm25", "decay_factor": 0.15, "personalized": false}),
            "Sorting results based on relevance score and popularity.",
        ),
        step(
            "7",
            "Analytics",
            "Server",
            "SEND_TELEMETRY",
            json!({"event": "search_performed", "term": query, "results_count": 50}),
            "Logging search telemetry to improve future recommendations.",
        ),
    ]
}

pub(crate) fn purchase_steps(product: &Product) -> Vec<Step> {
    vec![
        step(
            "1",
            "Cart Lock",
            "Client",
            "ACQUIRE_MUTEX",
            json!({"resource": format!("item:{}", product.id), "timeout": "5000ms"}),
            "Locking the item in your session to prevent inventory drift.",
        ),
        step(
            "2",
            "Stock Validator",
            "Inventory",
            "CHECK_STOCK_LEVELS",
            json!({"sku": product.id, "min_threshold": 1}),
            "Verifying that the item is physically available in the warehouse.",
        ),
        step(
            "3",
            "Tax Engine",
            "Server",
            "CALCULATE_VAT",
            json!({"subtotal": product.price, "region": "GLOBAL", "tax_rate": "15%"}),
            "Calculating applicable taxes and duties for your region.",
        ),
        step(
            "4",
            "Payment Gateway",
            "Payment",
            "STRIPE_CREATE_INTENT",
            json!({"amount": u64::from(product.price) * 100, "currency": "usd", "capture": "manual"}),
            "Initializing a secure payment tunnel with Stripe.",
        ),
        step(
            "5",
            "Fraud Detection",
            "Server",
            "ENTITY_RISK_SCORE",
            json!({"score": 0.02, "threshold": 0.85, "status": "PASS"}),
            "Analyzing transaction patterns to ensure security and prevent fraud.",
        ),
        step(
            "6",
            "Payment Processor",
            "Payment",
            "STRIPE_CHARGE_CONFIRM",
            json!({"tx_id": token("ch_", 6), "receipt_sent": true}),
            "Confirming the final funds transfer and capturing the payment.",
        ),
        step(
            "7",
            "Order Commit",
            "DB",
            "COMMIT_TRANSACTION",
            json!({"isolation": "SERIALIZABLE", "wal_sync": "IMMEDIATE"}),
            "Finalizing the order entry and updating permanent records.",
        ),
        step(
            "8",
            "Notify",
            "Gateway",
            "SMTP_QUEUE_ORDER_CONFIRM",
            json!({"template": "order_success", "priority": "high"}),
            "Queueing your email confirmation and shipping notification.",
        ),
    ]
}

pub(crate) fn cart_steps(action: CartAction, product: &Product) -> Vec<Step> {
    vec![
        step(
            "1",
            "Cart Engine",
            "UI",
            format!("DISPATCH_CART_{}", action.as_str().to_ascii_uppercase()),
            json!({"item_id": product.id, "product": product.name}),
            &format!(
                "Updating your local shopping context: {} {}",
                action.as_str(),
                product.name
            ),
        ),
        step(
            "2",
            "State Manager",
            "Client",
            "SYNC_REDUX_PERSIST",
            json!({"storage": "indexedDB", "namespace": "cart_cache"}),
            "Syncing the cart update to local persistent storage.",
        ),
        step(
            "3",
            "Backend Sync",
            "Server",
            "PATCH /api/v1/cart/sync",
            json!({"action": action.as_str(), "diff": 1, "session_id": "sess_81a"}),
            "Transmitting cart delta to the cloud for cross-device synchronization.",
        ),
        step(
            "4",
            "Reco Service",
            "Server",
            "FETCH_RECOMMENDATIONS",
            json!({"based_on": product.category.as_str(), "limit": 3}),
            "Updating real-time product recommendations based on your selection.",
        ),
        step(
            "5",
            "Update UI",
            "UI",
            "INVALIDATE_CART_VIEW",
            json!({"re_render": true, "animation": "slide_in"}),
            "Refreshing the interface to reflect your updated shopping cart.",
        ),
    ]
}

pub(crate) fn filter_steps(category: Category) -> Vec<Step> {
    vec![
        step(
            "1",
            "Route Guard",
            "Gateway",
            "VALIDATE_QUERY_PARAMS",
            json!({"category": category.as_str()}),
            &format!("Validating filter parameters for: {category}"),
        ),
        step(
            "2",
            "Logic Processor",
            "Client",
            "CLIENT_SIDE_SORT",
            json!({"algorithm": "quicksort", "field": "price"}),
            "Applying high-performance sorting logic to the product list.",
        ),
        Step::new("3", "Layout Engine", "UI", "VIRTUALIZED_LIST_REFRESH").with_explanation(
            insight("Updating the virtualized list view for optimal performance."),
        ),
    ]
}

pub(crate) fn logout_steps(now: OffsetDateTime) -> Vec<Step> {
    let timestamp = now
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default();
    vec![
        step(
            "1",
            "Sign Out",
            "UI",
            "CLEAR_LOCAL_STORAGE",
            json!({"keys": ["auth_token", "user_session"]}),
            "Clearing your secure credentials from the browser storage.",
        ),
        step(
            "2",
            "Auth Bridge",
            "Server",
            "REVOKE_SESSION",
            json!({"reason": "user_initiated", "timestamp": timestamp}),
            "Notifying the server to invalidate your current active session.",
        ),
        step(
            "3",
            "Logic",
            "Auth Service",
            "BLACK_LIST_JWT",
            json!({"fingerprint": "fp_92k", "ttl": "24h"}),
            "Adding your token to the global blacklist to prevent unauthorized reuse.",
        ),
        step(
            "4",
            "DB Sync",
            "DB",
            "LOG_LOGOUT_EVENT",
            json!({"user_id": "u1", "audit": "SUCCESS"}),
            "Recording the sign-out event in the security audit logs.",
        ),
        step(
            "5",
            "Redirect",
            "UI",
            "REPLACE_HISTORY_PUSH",
            json!({"next": "/login"}),
            "Redirecting you back to the login screen for maximum security.",
        ),
    ]
}
