//! Typed wrappers for each backend route. All of them go through the
//! [`RequestPipeline`], so they share its token handling.

use crate::api::error::ApiError;
use crate::api::pipeline::{ApiRequest, RequestPipeline};
use crate::api::types::{
    AnalysisTask, Candle, CreateAccountRequest, CreateOrderRequest, LoginRequest, LoginResponse,
    Market, Order, OrderStatus, Position, RegisterRequest, StartAnalysisRequest, StockInfo,
    StockQuote, StockSearchResult, TradingAccount, User, UserUpdate,
};

#[derive(Clone)]
pub struct TradingApi {
    pipeline: RequestPipeline,
}

impl TradingApi {
    pub fn new(pipeline: RequestPipeline) -> Self {
        Self { pipeline }
    }

    pub fn pipeline(&self) -> &RequestPipeline {
        &self.pipeline
    }

    /// Exchanges credentials for a token pair. Does not store the tokens;
    /// that is the session's job.
    pub async fn login(&self, request: &LoginRequest) -> Result<LoginResponse, ApiError> {
        let request = ApiRequest::post("/auth/login")
            .with_json(request)?
            .without_refresh();
        self.pipeline.execute_json(&request).await
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<User, ApiError> {
        #[derive(serde::Deserialize)]
        #[serde(untagged)]
        enum RegisterBody {
            Wrapped { user: User },
            Bare(User),
        }

        let request = ApiRequest::post("/auth/register")
            .with_json(request)?
            .without_refresh();
        match self.pipeline.execute_json(&request).await? {
            RegisterBody::Wrapped { user } | RegisterBody::Bare(user) => Ok(user),
        }
    }

    pub async fn current_user(&self) -> Result<User, ApiError> {
        self.pipeline.execute_json(&ApiRequest::get("/users/me")).await
    }

    pub async fn update_user(&self, update: &UserUpdate) -> Result<User, ApiError> {
        let request = ApiRequest::patch("/users/me").with_json(update)?;
        self.pipeline.execute_json(&request).await
    }

    pub async fn start_analysis(
        &self,
        request: &StartAnalysisRequest,
    ) -> Result<AnalysisTask, ApiError> {
        let request = ApiRequest::post("/analysis/start").with_json(request)?;
        self.pipeline.execute_json(&request).await
    }

    pub async fn analysis_task(&self, task_id: &str) -> Result<AnalysisTask, ApiError> {
        let path = format!("/analysis/{}", segment(task_id));
        self.pipeline.execute_json(&ApiRequest::get(path)).await
    }

    pub async fn analysis_result(&self, task_id: &str) -> Result<AnalysisTask, ApiError> {
        let path = format!("/analysis/{}/result", segment(task_id));
        self.pipeline.execute_json(&ApiRequest::get(path)).await
    }

    pub async fn analysis_history(
        &self,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<AnalysisTask>, ApiError> {
        let request = ApiRequest::get("/analysis/history")
            .with_query("page", page.max(1))
            .with_query("page_size", page_size);
        self.pipeline.execute_json(&request).await
    }

    pub async fn delete_analysis(&self, task_id: &str) -> Result<(), ApiError> {
        let path = format!("/analysis/{}", segment(task_id));
        self.pipeline.execute(&ApiRequest::delete(path)).await?;
        Ok(())
    }

    pub async fn search_stocks(&self, query: &str) -> Result<Vec<StockSearchResult>, ApiError> {
        let request = ApiRequest::get("/stocks/search").with_query("q", query.trim());
        self.pipeline.execute_json(&request).await
    }

    pub async fn stock_info(&self, symbol: &str, market: Market) -> Result<StockInfo, ApiError> {
        let request =
            ApiRequest::get(format!("/stocks/{}", segment(symbol))).with_query("market", market);
        self.pipeline.execute_json(&request).await
    }

    pub async fn stock_quote(&self, symbol: &str, market: Market) -> Result<StockQuote, ApiError> {
        let request = ApiRequest::get(format!("/stocks/{}/quote", segment(symbol)))
            .with_query("market", market);
        self.pipeline.execute_json(&request).await
    }

    /// Daily candles between two `YYYY-MM-DD` dates, inclusive.
    pub async fn stock_history(
        &self,
        symbol: &str,
        market: Market,
        start_date: &str,
        end_date: &str,
    ) -> Result<Vec<Candle>, ApiError> {
        let request = ApiRequest::get(format!("/stocks/{}/history", segment(symbol)))
            .with_query("market", market)
            .with_query("start_date", start_date)
            .with_query("end_date", end_date);
        self.pipeline.execute_json(&request).await
    }

    pub async fn trading_account(&self) -> Result<TradingAccount, ApiError> {
        self.pipeline
            .execute_json(&ApiRequest::get("/trading/account"))
            .await
    }

    pub async fn create_trading_account(
        &self,
        request: &CreateAccountRequest,
    ) -> Result<TradingAccount, ApiError> {
        let request = ApiRequest::post("/trading/account").with_json(request)?;
        self.pipeline.execute_json(&request).await
    }

    pub async fn positions(&self) -> Result<Vec<Position>, ApiError> {
        self.pipeline
            .execute_json(&ApiRequest::get("/trading/positions"))
            .await
    }

    pub async fn orders(&self, status: Option<OrderStatus>) -> Result<Vec<Order>, ApiError> {
        let mut request = ApiRequest::get("/trading/orders");
        if let Some(status) = status {
            request = request.with_query("status", status.as_str());
        }
        self.pipeline.execute_json(&request).await
    }

    pub async fn order(&self, order_id: &str) -> Result<Order, ApiError> {
        let path = format!("/trading/orders/{}", segment(order_id));
        self.pipeline.execute_json(&ApiRequest::get(path)).await
    }

    pub async fn create_order(&self, request: &CreateOrderRequest) -> Result<Order, ApiError> {
        let request = ApiRequest::post("/trading/orders").with_json(request)?;
        self.pipeline.execute_json(&request).await
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<(), ApiError> {
        let path = format!("/trading/orders/{}", segment(order_id));
        self.pipeline.execute(&ApiRequest::delete(path)).await?;
        Ok(())
    }
}

fn segment(value: &str) -> String {
    urlencoding::encode(value.trim()).into_owned()
}
