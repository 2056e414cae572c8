//! Token metadata and risk-gate collaborators. The engine only sees the two
//! traits; HTTP clients here are the production implementations.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("token {0} not present in response")]
    MissingToken(String),
}

/// Fresh token metadata from the data API.
#[derive(Debug, Clone, Default)]
pub struct TokenMetadata {
    pub contract_address: String,
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub decimals: u8,
    pub total_supply: f64,
    pub price_sol: f64,
    pub market_cap_sol: f64,
    pub liquidity_sol: f64,
    pub liquidity_usd: f64,
    pub is_mintable: bool,
    pub is_freezable: bool,
}

#[async_trait]
pub trait TokenMetadataProvider: Send + Sync {
    async fn get_token_metadata(&self, contract_address: &str) -> Result<TokenMetadata>;

    /// Share of supply held by the top `top_n` wallets, in percent.
    async fn get_holder_concentration(&self, contract_address: &str, top_n: usize)
        -> Result<f64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    fn from_score(score: u32) -> Self {
        match score {
            0..=24 => Self::Low,
            25..=49 => Self::Medium,
            50..=69 => Self::High,
            _ => Self::Critical,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RiskAssessment {
    pub contract_address: String,
    pub risk_level: RiskLevel,
    pub risk_score: u32,
    pub passed: bool,
    pub warnings: Vec<String>,
}

#[async_trait]
pub trait RiskAssessor: Send + Sync {
    async fn check_token(&self, contract_address: &str) -> Result<RiskAssessment>;
}

// ---------------------------------------------------------------------------
// Metadata HTTP client

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiTokenInfo {
    name: Option<String>,
    symbol: Option<String>,
    decimals: Option<u8>,
    total_supply: Option<f64>,
    price_sol: Option<f64>,
    market_cap_sol: Option<f64>,
    liquidity_sol: Option<f64>,
    liquidity_usd: Option<f64>,
    mint_authority: Option<String>,
    freeze_authority: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiHolder {
    #[allow(dead_code)]
    address: Option<String>,
    supply_pct: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiHoldersResponse {
    holders: Vec<ApiHolder>,
}

pub struct HttpMetadataProvider {
    base_url: String,
    client: reqwest::Client,
}

impl HttpMetadataProvider {
    pub fn new(base_url: &str, timeout: std::time::Duration) -> Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }

    fn token_url(&self, contract_address: &str) -> Result<Url> {
        let mut url = Url::parse(&format!("{}/tokens", self.base_url))?;
        url.query_pairs_mut().append_pair("mint", contract_address);
        Ok(url)
    }

    fn holders_url(&self, contract_address: &str, top_n: usize) -> Result<Url> {
        let mut url = Url::parse(&format!("{}/holders", self.base_url))?;
        url.query_pairs_mut()
            .append_pair("mint", contract_address)
            .append_pair("limit", &top_n.to_string());
        Ok(url)
    }
}

impl HttpMetadataProvider {
    async fn fetch_json<T: serde::de::DeserializeOwned>(
        &self,
        url: Url,
    ) -> Result<T, ProviderError> {
        Ok(self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }
}

#[async_trait]
impl TokenMetadataProvider for HttpMetadataProvider {
    async fn get_token_metadata(&self, contract_address: &str) -> Result<TokenMetadata> {
        let url = self.token_url(contract_address)?;
        let info: ApiTokenInfo = self.fetch_json(url).await?;

        Ok(TokenMetadata {
            contract_address: contract_address.to_string(),
            name: info.name,
            symbol: info.symbol,
            decimals: info.decimals.unwrap_or(9),
            total_supply: info.total_supply.unwrap_or(0.0),
            price_sol: info.price_sol.unwrap_or(0.0),
            market_cap_sol: info.market_cap_sol.unwrap_or(0.0),
            liquidity_sol: info.liquidity_sol.unwrap_or(0.0),
            liquidity_usd: info.liquidity_usd.unwrap_or(0.0),
            is_mintable: info.mint_authority.is_some(),
            is_freezable: info.freeze_authority.is_some(),
        })
    }

    async fn get_holder_concentration(
        &self,
        contract_address: &str,
        top_n: usize,
    ) -> Result<f64> {
        let url = self.holders_url(contract_address, top_n)?;
        let resp: ApiHoldersResponse = self.fetch_json(url).await?;
        Ok(resp
            .holders
            .iter()
            .take(top_n)
            .filter_map(|h| h.supply_pct)
            .sum())
    }
}

// ---------------------------------------------------------------------------
// Risk gate

/// Minimum liquidity before the low-liquidity penalty applies.
const MIN_LIQUIDITY_USD: f64 = 5_000.0;
/// Max share the top holders may control before the concentration penalty.
const MAX_TOP_CONCENTRATION_PCT: f64 = 50.0;

/// Tickers frequently impersonated by scam launches.
const COPYCAT_PATTERNS: [&str; 10] = [
    "BONK", "WIF", "PEPE", "DOGE", "SHIB", "SOL", "ETH", "BTC", "USDC", "USDT",
];

/// Security facts about one token, as reported by the security API plus the
/// holder distribution lookup.
#[derive(Debug, Clone, Default)]
pub struct SecurityReport {
    pub is_mintable: bool,
    pub is_freezable: bool,
    pub lp_unlocked: bool,
    pub is_honeypot: bool,
    pub liquidity_usd: f64,
    pub top_holder_pct: f64,
    pub name: Option<String>,
    pub symbol: Option<String>,
}

/// Returns the known token a symbol/name appears to impersonate.
pub fn copycat_of(symbol: Option<&str>, name: Option<&str>) -> Option<&'static str> {
    let symbol = symbol.unwrap_or("").to_uppercase();
    let name = name.unwrap_or("").to_uppercase();
    if symbol.is_empty() && name.is_empty() {
        return None;
    }

    for known in COPYCAT_PATTERNS {
        if symbol == known {
            return Some(known);
        }
        if name.contains(known) && name != known {
            return Some(known);
        }
        let variants = [
            format!("{known}2"),
            format!("{known}2.0"),
            format!("BABY{known}"),
            format!("MINI{known}"),
            format!("{known}INU"),
            format!("{known}MOON"),
        ];
        if variants.iter().any(|v| symbol == *v) {
            return Some(known);
        }
    }
    None
}

/// Score a security report into a pass/fail risk assessment. Pure: the HTTP
/// layer gathers facts, this decides.
pub fn assess(report: &SecurityReport, contract_address: &str) -> RiskAssessment {
    let mut score = 0_u32;
    let mut warnings = Vec::new();

    if report.is_mintable {
        score += 25;
        warnings.push("token is MINTABLE, supply can be inflated".to_string());
    }
    if report.is_freezable {
        score += 30;
        warnings.push("token has FREEZE authority, honeypot risk".to_string());
    }
    if report.lp_unlocked {
        score += 20;
        warnings.push("liquidity is NOT locked, rug pull risk".to_string());
    }
    if report.liquidity_usd < MIN_LIQUIDITY_USD {
        score += 10;
        warnings.push(format!("low liquidity: ${:.0}", report.liquidity_usd));
    }
    if report.top_holder_pct > MAX_TOP_CONCENTRATION_PCT {
        score += 15;
        warnings.push(format!(
            "high concentration: top holders control {:.1}%",
            report.top_holder_pct
        ));
    }
    if report.is_honeypot {
        score += 40;
        warnings.push("HONEYPOT detected, token cannot be sold".to_string());
    }
    if let Some(known) = copycat_of(report.symbol.as_deref(), report.name.as_deref()) {
        score += 10;
        warnings.push(format!("possible copycat of {known}"));
    }

    let score = score.min(100);
    let risk_level = RiskLevel::from_score(score);
    RiskAssessment {
        contract_address: contract_address.to_string(),
        risk_level,
        risk_score: score,
        // High and critical risk never reach users.
        passed: matches!(risk_level, RiskLevel::Low | RiskLevel::Medium),
        warnings,
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiSecurityInfo {
    lp_locked: Option<bool>,
    honeypot: Option<bool>,
    cannot_sell_all: Option<bool>,
    transfer_pausable: Option<bool>,
}

impl ApiSecurityInfo {
    /// Any of the three sellability flags marks the token a honeypot.
    fn is_honeypot(&self) -> bool {
        self.honeypot.unwrap_or(false)
            || self.cannot_sell_all.unwrap_or(false)
            || self.transfer_pausable.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ApiSecurityResponse {
    result: std::collections::HashMap<String, ApiSecurityInfo>,
}

/// Risk assessor combining a token-security API (LP lock, sellability) with
/// the metadata provider (authorities, liquidity, holder concentration).
pub struct HttpRiskAssessor {
    base_url: String,
    client: reqwest::Client,
    metadata: std::sync::Arc<dyn TokenMetadataProvider>,
    top_holders: usize,
}

impl HttpRiskAssessor {
    pub fn new(
        base_url: &str,
        timeout: std::time::Duration,
        metadata: std::sync::Arc<dyn TokenMetadataProvider>,
        top_holders: usize,
    ) -> Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder().timeout(timeout).build()?,
            metadata,
            top_holders,
        })
    }

    fn security_url(&self, contract_address: &str) -> Result<Url> {
        let mut url = Url::parse(&format!("{}/token_security", self.base_url))?;
        url.query_pairs_mut()
            .append_pair("contract_addresses", contract_address);
        Ok(url)
    }
}

#[async_trait]
impl RiskAssessor for HttpRiskAssessor {
    async fn check_token(&self, contract_address: &str) -> Result<RiskAssessment> {
        let url = self.security_url(contract_address)?;
        let resp: ApiSecurityResponse = {
            let resp = self.client.get(url).send().await.map_err(ProviderError::Http)?;
            resp.error_for_status()
                .map_err(ProviderError::Http)?
                .json()
                .await
                .map_err(ProviderError::Http)?
        };
        let info = resp
            .result
            .get(contract_address)
            .ok_or_else(|| ProviderError::MissingToken(contract_address.to_string()))?;

        let meta = self.metadata.get_token_metadata(contract_address).await?;

        // Concentration lookup is best-effort; a miss scores as unknown (0%).
        let top_holder_pct = self
            .metadata
            .get_holder_concentration(contract_address, self.top_holders)
            .await
            .unwrap_or_else(|e| {
                tracing::debug!(error = %e, token = contract_address, "holder lookup failed");
                0.0
            });

        let report = SecurityReport {
            is_mintable: meta.is_mintable,
            is_freezable: meta.is_freezable,
            lp_unlocked: !info.lp_locked.unwrap_or(true),
            is_honeypot: info.is_honeypot(),
            liquidity_usd: meta.liquidity_usd,
            top_holder_pct,
            name: meta.name.clone(),
            symbol: meta.symbol.clone(),
        };

        let assessment = assess(&report, contract_address);
        tracing::info!(
            token = contract_address,
            risk = assessment.risk_level.as_str(),
            score = assessment.risk_score,
            passed = assessment.passed,
            "rug check complete"
        );
        Ok(assessment)
    }
}

/// Static stand-ins for the provider traits, shared across module tests.
#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    pub struct StaticMetadata {
        pub meta: TokenMetadata,
        pub concentration: f64,
        pub fail: AtomicBool,
    }

    impl StaticMetadata {
        pub fn new(meta: TokenMetadata) -> Self {
            Self {
                meta,
                concentration: 0.0,
                fail: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl TokenMetadataProvider for StaticMetadata {
        async fn get_token_metadata(&self, contract_address: &str) -> Result<TokenMetadata> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("metadata api unreachable");
            }
            let mut meta = self.meta.clone();
            meta.contract_address = contract_address.to_string();
            Ok(meta)
        }

        async fn get_holder_concentration(&self, _ca: &str, _top_n: usize) -> Result<f64> {
            Ok(self.concentration)
        }
    }

    pub struct StaticRisk {
        pub assessment: RiskAssessment,
    }

    impl StaticRisk {
        pub fn passing() -> Self {
            Self {
                assessment: RiskAssessment {
                    contract_address: String::new(),
                    risk_level: RiskLevel::Low,
                    risk_score: 10,
                    passed: true,
                    warnings: vec![],
                },
            }
        }

        pub fn failing() -> Self {
            Self {
                assessment: RiskAssessment {
                    contract_address: String::new(),
                    risk_level: RiskLevel::Critical,
                    risk_score: 85,
                    passed: false,
                    warnings: vec!["HONEYPOT detected, token cannot be sold".to_string()],
                },
            }
        }
    }

    #[async_trait]
    impl RiskAssessor for StaticRisk {
        async fn check_token(&self, contract_address: &str) -> Result<RiskAssessment> {
            let mut a = self.assessment.clone();
            a.contract_address = contract_address.to_string();
            Ok(a)
        }
    }
}
