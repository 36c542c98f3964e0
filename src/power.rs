//! Demonstration contract: squaring and raising to the fourth power.
//!
//! Values are `i64`. A result that does not fit fails with an
//! [`InvocationError`] instead of wrapping.

use crate::{InvocationError, RpcResult, rpc_service};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    value: i64,
}

impl Request {
    pub fn from_fields(value: i64) -> Self {
        Self { value }
    }

    pub fn value(&self) -> i64 {
        self.value
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    value: i64,
}

impl Response {
    pub fn from_fields(value: i64) -> Self {
        Self { value }
    }

    pub fn value(&self) -> i64 {
        self.value
    }
}

#[rpc_service]
pub trait SimpleService: Send + Sync {
    async fn power_of_two(&self, request: Request) -> RpcResult<Response>;

    async fn power_of_four(&self, request: Request) -> RpcResult<Response>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PowerService;

impl PowerService {
    fn power(value: i64, exp: u32) -> Result<Response, InvocationError> {
        value
            .checked_pow(exp)
            .map(Response::from_fields)
            .ok_or_else(|| InvocationError::new(format!("{value}^{exp} overflows i64")))
    }
}

impl SimpleService for PowerService {
    async fn power_of_two(&self, request: Request) -> RpcResult<Response> {
        Ok(Self::power(request.value(), 2)?)
    }

    async fn power_of_four(&self, request: Request) -> RpcResult<Response> {
        Ok(Self::power(request.value(), 4)?)
    }
}
