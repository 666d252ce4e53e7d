#![forbid(unsafe_code)]
//! Mock storefront backing the simulated workflows.
//!
//! The whole [`ShopState`] is one JSON document persisted through a
//! [`DocumentStore`]. Writes replace the document (last writer wins) and
//! [`Shop::refresh`] pulls the latest copy at workflow synchronization points.
//! Store failures are logged and absorbed; they never surface as workflow errors.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

/// Document key the storefront state lives under.
pub const SHOP_DOCUMENT_KEY: &str = "shop";

pub const DEMO_EMAIL: &str = "demo@breakthru.dev";
pub const DEMO_PASSWORD: &str = "password";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ShopError {
    #[error("User not found")]
    UserNotFound,
    #[error("Invalid password")]
    InvalidPassword,
    #[error("Email already exists")]
    EmailTaken,
    #[error("Product not found: {0}")]
    ProductNotFound(String),
    #[error("validation error: {0}")]
    Validation(String),
}

/// Whole-document key-value store.
pub trait DocumentStore: Send {
    fn store_name(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn get(&self, key: &str) -> Result<Option<Value>>;

    #[allow(clippy::missing_errors_doc)]
    fn set(&self, key: &str, value: &Value) -> Result<()>;
}

/// Process-local [`DocumentStore`]; can be taken offline to model an unreachable backend.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    documents: Mutex<BTreeMap<String, Value>>,
    offline: AtomicBool,
}

impl MemoryDocumentStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(anyhow!("document store offline"));
        }
        Ok(())
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn store_name(&self) -> &'static str {
        "memory"
    }

    fn get(&self, key: &str) -> Result<Option<Value>> {
        self.ensure_online()?;
        Ok(self.documents.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &Value) -> Result<()> {
        self.ensure_online()?;
        self.documents.lock().insert(key.to_string(), value.clone());
        Ok(())
    }
}

impl<T: DocumentStore + Sync> DocumentStore for std::sync::Arc<T> {
    fn store_name(&self) -> &'static str {
        (**self).store_name()
    }

    fn get(&self, key: &str) -> Result<Option<Value>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &Value) -> Result<()> {
        (**self).set(key, value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    pub avatar: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Category {
    Laptops,
    Mobiles,
    Accessories,
    Wearables,
}

impl Category {
    pub const ALL: [Self; 4] = [
        Self::Laptops,
        Self::Mobiles,
        Self::Accessories,
        Self::Wearables,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Laptops => "Laptops",
            Self::Mobiles => "Mobiles",
            Self::Accessories => "Accessories",
            Self::Wearables => "Wearables",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|category| category.as_str().eq_ignore_ascii_case(value.trim()))
    }
}

impl Display for Category {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub price: u32,
    pub image: String,
    pub category: Category,
    pub description: String,
    pub stock: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CartItem {
    #[serde(flatten)]
    pub product: Product,
    pub quantity: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ShopState {
    pub users: Vec<User>,
    #[serde(default)]
    pub session: Option<User>,
    pub products: Vec<Product>,
    #[serde(default)]
    pub cart: Vec<CartItem>,
}

impl Default for ShopState {
    fn default() -> Self {
        Self {
            users: vec![User {
                id: "u1".to_string(),
                email: DEMO_EMAIL.to_string(),
                name: "Demo User".to_string(),
                avatar: avatar_url("Demo User", "3b82f6"),
                password: Some(DEMO_PASSWORD.to_string()),
            }],
            session: None,
            products: seed_products(),
            cart: Vec::new(),
        }
    }
}

/// Partial document used by [`Shop::refresh`]; absent keys keep local values.
#[derive(Debug, Default, Deserialize)]
struct RefreshDocument {
    users: Option<Vec<User>>,
    products: Option<Vec<Product>>,
    cart: Option<Vec<CartItem>>,
}

#[must_use]
pub fn seed_products() -> Vec<Product> {
    let mut products = Vec::with_capacity(55);
    for i in 1..=10u32 {
        products.push(Product {
            id: format!("lap-{i}"),
            name: format!("QuantumBook Pro v{i}"),
            price: 1200 + i * 100,
            image: "💻".to_string(),
            category: Category::Laptops,
            description: "High-performance quantum laptop.".to_string(),
            stock: 0,
        });
    }
    for i in 1..=15u32 {
        products.push(Product {
            id: format!("mob-{i}"),
            name: format!("NeuralPhone X{i}"),
            price: 800 + i * 50,
            image: "📱".to_string(),
            category: Category::Mobiles,
            description: "Direct neural interface smartphone.".to_string(),
            stock: 100,
        });
    }
    for i in 1..=15u32 {
        products.push(Product {
            id: format!("acc-{i}"),
            name: format!("Holo-Projector Mini {i}"),
            price: 150 + i * 20,
            image: "🔌".to_string(),
            category: Category::Accessories,
            description: "Portable holographic emitter.".to_string(),
            stock: 200,
        });
    }
    for i in 1..=15u32 {
        products.push(Product {
            id: format!("wear-{i}"),
            name: format!("SmartLens AR {i}"),
            price: 300 + i * 40,
            image: "👓".to_string(),
            category: Category::Wearables,
            description: "Augmented reality contact lenses.".to_string(),
            stock: 75,
        });
    }
    products
}

fn avatar_url(name: &str, background: &str) -> String {
    let encoded: String = name
        .chars()
        .map(|ch| if ch.is_whitespace() { '+' } else { ch })
        .collect();
    format!("https://ui-avatars.com/api/?name={encoded}&background={background}&color=fff")
}

fn ensure_non_empty(field_name: &str, value: &str) -> Result<(), ShopError> {
    if value.trim().is_empty() {
        return Err(ShopError::Validation(format!("{field_name} MUST be non-empty")));
    }
    Ok(())
}

/// Storefront state plus the store it is persisted to.
pub struct Shop {
    state: ShopState,
    store: Box<dyn DocumentStore>,
}

impl std::fmt::Debug for Shop {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shop")
            .field("store", &self.store.store_name())
            .field("users", &self.state.users.len())
            .field("products", &self.state.products.len())
            .field("cart", &self.state.cart.len())
            .finish_non_exhaustive()
    }
}

impl Shop {
    /// Hydrate from `store`, seeding and persisting the default catalog when no
    /// document exists yet. An unreadable store leaves the seed in memory.
    pub fn open(store: Box<dyn DocumentStore>) -> Self {
        let mut shop = Self {
            state: ShopState::default(),
            store,
        };
        match shop.load_document() {
            Ok(Some(state)) => shop.state = state,
            Ok(None) => shop.persist(),
            Err(err) => {
                tracing::warn!(store = shop.store.store_name(), error = %err, "shop hydrate failed; using seed data");
            }
        }
        shop
    }

    #[must_use]
    pub fn state(&self) -> &ShopState {
        &self.state
    }

    #[must_use]
    pub fn session(&self) -> Option<&User> {
        self.state.session.as_ref()
    }

    #[must_use]
    pub fn products(&self) -> &[Product] {
        &self.state.products
    }

    #[must_use]
    pub fn cart(&self) -> &[CartItem] {
        &self.state.cart
    }

    #[must_use]
    pub fn cart_count(&self) -> u32 {
        self.state.cart.iter().map(|item| item.quantity).sum()
    }

    /// Pull users, products and cart from the store. Failures are absorbed.
    pub fn refresh(&mut self) {
        let document = match self.store.get(SHOP_DOCUMENT_KEY) {
            Ok(Some(value)) => value,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(store = self.store.store_name(), error = %err, "shop refresh failed");
                return;
            }
        };
        let refreshed: RefreshDocument = match serde_json::from_value(document) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(error = %err, "shop document unreadable; keeping local state");
                return;
            }
        };
        if let Some(users) = refreshed.users {
            self.state.users = users;
        }
        if let Some(products) = refreshed.products {
            self.state.products = products;
        }
        if let Some(cart) = refreshed.cart {
            self.state.cart = cart;
        }
    }

    /// # Errors
    /// Returns [`ShopError::UserNotFound`] or [`ShopError::InvalidPassword`].
    pub fn login(&mut self, email: &str, password: &str) -> Result<User, ShopError> {
        let user = self
            .state
            .users
            .iter()
            .find(|user| user.email == email)
            .cloned()
            .ok_or(ShopError::UserNotFound)?;
        if user.password.as_deref() != Some(password) {
            return Err(ShopError::InvalidPassword);
        }
        self.state.session = Some(user.clone());
        self.persist();
        Ok(user)
    }

    /// Create an account and sign it in.
    ///
    /// # Errors
    /// Returns [`ShopError::Validation`] for blank fields and
    /// [`ShopError::EmailTaken`] when the email is already registered.
    pub fn register(&mut self, email: &str, password: &str, name: &str) -> Result<User, ShopError> {
        ensure_non_empty("email", email)?;
        ensure_non_empty("password", password)?;
        ensure_non_empty("name", name)?;
        if self.state.users.iter().any(|user| user.email == email) {
            return Err(ShopError::EmailTaken);
        }

        let user = User {
            id: Ulid::new().to_string().to_ascii_lowercase(),
            email: email.to_string(),
            name: name.to_string(),
            avatar: avatar_url(name, "random"),
            password: Some(password.to_string()),
        };
        self.state.users.push(user.clone());
        self.state.session = Some(user.clone());
        self.persist();
        Ok(user)
    }

    pub fn logout(&mut self) {
        self.state.session = None;
        self.state.cart.clear();
        self.persist();
    }

    #[must_use]
    pub fn get_product(&self, id: &str) -> Option<&Product> {
        self.state.products.iter().find(|product| product.id == id)
    }

    /// Case-insensitive substring match on name, category and description.
    #[must_use]
    pub fn search_products(&self, query: &str) -> Vec<Product> {
        let needle = query.to_lowercase();
        self.state
            .products
            .iter()
            .filter(|product| {
                product.name.to_lowercase().contains(&needle)
                    || product.category.as_str().to_lowercase().contains(&needle)
                    || product.description.to_lowercase().contains(&needle)
            })
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn products_in(&self, category: Category) -> Vec<Product> {
        self.state
            .products
            .iter()
            .filter(|product| product.category == category)
            .cloned()
            .collect()
    }

    pub fn add_to_cart(&mut self, product: &Product) {
        match self
            .state
            .cart
            .iter_mut()
            .find(|item| item.product.id == product.id)
        {
            Some(item) => item.quantity += 1,
            None => self.state.cart.push(CartItem {
                product: product.clone(),
                quantity: 1,
            }),
        }
        self.persist();
    }

    pub fn remove_from_cart(&mut self, product_id: &str) {
        self.state.cart.retain(|item| item.product.id != product_id);
        self.persist();
    }

    pub fn clear_cart(&mut self) {
        self.state.cart.clear();
        self.persist();
    }

    /// Overwrite a product's stock level.
    ///
    /// # Errors
    /// Returns [`ShopError::ProductNotFound`] for unknown ids.
    pub fn set_stock(&mut self, product_id: &str, stock: u32) -> Result<(), ShopError> {
        let product = self
            .state
            .products
            .iter_mut()
            .find(|product| product.id == product_id)
            .ok_or_else(|| ShopError::ProductNotFound(product_id.to_string()))?;
        product.stock = stock;
        self.persist();
        Ok(())
    }

    fn load_document(&self) -> Result<Option<ShopState>> {
        match self.store.get(SHOP_DOCUMENT_KEY)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    fn persist(&self) {
        let result = serde_json::to_value(&self.state)
            .map_err(anyhow::Error::from)
            .and_then(|value| self.store.set(SHOP_DOCUMENT_KEY, &value));
        if let Err(err) = result {
            tracing::warn!(store = self.store.store_name(), error = %err, "shop persist failed");
        }
    }
}
