//! Shared fixtures for the integration tests: a handful of interfaces
//! written the way the interface generator would emit them - a trait, a
//! stub that decodes and dispatches, a proxy that encodes and forwards,
//! and the `RemoteInterface` glue tying them together.

#![allow(dead_code)]

use async_trait::async_trait;
use canopy::bindings::{self, RemoteInterface};
use canopy::error::{RpcError, RpcResult};
use canopy::pointers::Shared;
use canopy::proxy::ObjectProxy;
use canopy::service::Service;
use canopy::stub::{InterfaceStub, ObjectStub};
use canopy::transport::ConnectionHandler;
use canopy::types::{
    CallerZoneId, Encoding, InterfaceDescriptor, InterfaceOrdinal, MethodId,
};
use canopy::wire;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::{Arc, Weak};

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll until `predicate` holds or the deadline passes.
pub async fn wait_until<F: Fn() -> bool>(predicate: F) -> bool {
    for _ in 0..200 {
        if predicate() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    predicate()
}

// ============================================================================
// Calculator
// ============================================================================

pub const CALCULATOR_INTERFACE: InterfaceOrdinal = InterfaceOrdinal(0xCA1C);

pub fn calculator_interface_id(_protocol_version: u64) -> InterfaceOrdinal {
    CALCULATOR_INTERFACE
}

pub mod calculator_methods {
    use canopy::types::MethodId;

    pub const ADD: MethodId = MethodId(1);
    pub const SUBTRACT: MethodId = MethodId(2);
    pub const DIVIDE: MethodId = MethodId(3);
}

#[async_trait]
pub trait Calculator: Send + Sync {
    async fn add(&self, a: i32, b: i32) -> RpcResult<i32>;
    async fn subtract(&self, a: i32, b: i32) -> RpcResult<i32>;
    async fn divide(&self, a: i32, b: i32) -> RpcResult<i32>;
}

pub struct CalculatorImpl;

#[async_trait]
impl Calculator for CalculatorImpl {
    async fn add(&self, a: i32, b: i32) -> RpcResult<i32> {
        Ok(a + b)
    }

    async fn subtract(&self, a: i32, b: i32) -> RpcResult<i32> {
        Ok(a - b)
    }

    async fn divide(&self, a: i32, b: i32) -> RpcResult<i32> {
        if b == 0 {
            return Err(RpcError::InvalidData);
        }
        Ok(a / b)
    }
}

pub struct CalculatorStub {
    pub target: Arc<dyn Calculator>,
    pub object: Weak<ObjectStub>,
}

#[async_trait]
impl InterfaceStub for CalculatorStub {
    fn interface_id(&self, protocol_version: u64) -> InterfaceOrdinal {
        calculator_interface_id(protocol_version)
    }

    async fn call(
        &self,
        _protocol_version: u64,
        encoding: Encoding,
        _caller_zone: CallerZoneId,
        method: MethodId,
        in_data: &[u8],
    ) -> RpcResult<Vec<u8>> {
        match method {
            calculator_methods::ADD => {
                let (a, b): (i32, i32) = wire::decode(encoding, in_data)?;
                let sum = self.target.add(a, b).await?;
                wire::encode(encoding, &sum)
            }
            calculator_methods::SUBTRACT => {
                let (a, b): (i32, i32) = wire::decode(encoding, in_data)?;
                let difference = self.target.subtract(a, b).await?;
                wire::encode(encoding, &difference)
            }
            calculator_methods::DIVIDE => {
                let (a, b): (i32, i32) = wire::decode(encoding, in_data)?;
                let quotient = self.target.divide(a, b).await?;
                wire::encode(encoding, &quotient)
            }
            _ => Err(RpcError::InvalidData),
        }
    }

    fn cast(&self, _interface: InterfaceOrdinal) -> RpcResult<Option<Arc<dyn InterfaceStub>>> {
        Ok(None)
    }

    fn target_address(&self) -> usize {
        Arc::as_ptr(&self.target) as *const () as usize
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct CalculatorProxy {
    object: Arc<ObjectProxy>,
}

#[async_trait]
impl Calculator for CalculatorProxy {
    async fn add(&self, a: i32, b: i32) -> RpcResult<i32> {
        let encoding = self.object.service_proxy().encoding();
        let data = wire::encode(encoding, &(a, b))?;
        let output = self
            .object
            .call(0, &calculator_interface_id, calculator_methods::ADD, &data)
            .await?;
        wire::decode(encoding, &output.data)
    }

    async fn subtract(&self, a: i32, b: i32) -> RpcResult<i32> {
        let encoding = self.object.service_proxy().encoding();
        let data = wire::encode(encoding, &(a, b))?;
        let output = self
            .object
            .call(
                0,
                &calculator_interface_id,
                calculator_methods::SUBTRACT,
                &data,
            )
            .await?;
        wire::decode(encoding, &output.data)
    }

    async fn divide(&self, a: i32, b: i32) -> RpcResult<i32> {
        let encoding = self.object.service_proxy().encoding();
        let data = wire::encode(encoding, &(a, b))?;
        let output = self
            .object
            .call(
                0,
                &calculator_interface_id,
                calculator_methods::DIVIDE,
                &data,
            )
            .await?;
        wire::decode(encoding, &output.data)
    }
}

impl RemoteInterface for dyn Calculator {
    fn interface_id(protocol_version: u64) -> InterfaceOrdinal {
        calculator_interface_id(protocol_version)
    }

    fn create_proxy(object: Arc<ObjectProxy>) -> Arc<Self> {
        Arc::new(CalculatorProxy { object })
    }

    fn create_stub(target: Arc<Self>, object: Weak<ObjectStub>) -> Arc<dyn InterfaceStub> {
        Arc::new(CalculatorStub { target, object })
    }

    fn from_stub(stub: &Arc<dyn InterfaceStub>) -> Option<Arc<Self>> {
        stub.as_any()
            .downcast_ref::<CalculatorStub>()
            .map(|s| s.target.clone())
    }
}

// ============================================================================
// DataProcessor
// ============================================================================

pub const DATA_PROCESSOR_INTERFACE: InterfaceOrdinal = InterfaceOrdinal(0xDA7A);

pub fn data_processor_interface_id(_protocol_version: u64) -> InterfaceOrdinal {
    DATA_PROCESSOR_INTERFACE
}

pub mod data_processor_methods {
    use canopy::types::MethodId;

    pub const PROCESS_VECTOR: MethodId = MethodId(1);
    pub const ECHO_BINARY: MethodId = MethodId(2);
}

#[async_trait]
pub trait DataProcessor: Send + Sync {
    async fn process_vector(&self, input: Vec<i32>) -> RpcResult<Vec<i32>>;
    async fn echo_binary(&self, data: Vec<u8>) -> RpcResult<Vec<u8>>;
}

impl std::fmt::Debug for dyn DataProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dyn DataProcessor")
    }
}

pub struct DataProcessorImpl;

#[async_trait]
impl DataProcessor for DataProcessorImpl {
    async fn process_vector(&self, input: Vec<i32>) -> RpcResult<Vec<i32>> {
        Ok(input.into_iter().map(|v| v * 2).collect())
    }

    async fn echo_binary(&self, data: Vec<u8>) -> RpcResult<Vec<u8>> {
        Ok(data)
    }
}

pub struct DataProcessorStub {
    pub target: Arc<dyn DataProcessor>,
    pub object: Weak<ObjectStub>,
}

#[async_trait]
impl InterfaceStub for DataProcessorStub {
    fn interface_id(&self, protocol_version: u64) -> InterfaceOrdinal {
        data_processor_interface_id(protocol_version)
    }

    async fn call(
        &self,
        _protocol_version: u64,
        encoding: Encoding,
        _caller_zone: CallerZoneId,
        method: MethodId,
        in_data: &[u8],
    ) -> RpcResult<Vec<u8>> {
        match method {
            data_processor_methods::PROCESS_VECTOR => {
                let input: Vec<i32> = wire::decode(encoding, in_data)?;
                let output = self.target.process_vector(input).await?;
                wire::encode(encoding, &output)
            }
            data_processor_methods::ECHO_BINARY => {
                let input: Vec<u8> = wire::decode(encoding, in_data)?;
                let output = self.target.echo_binary(input).await?;
                wire::encode(encoding, &output)
            }
            _ => Err(RpcError::InvalidData),
        }
    }

    fn cast(&self, _interface: InterfaceOrdinal) -> RpcResult<Option<Arc<dyn InterfaceStub>>> {
        Ok(None)
    }

    fn target_address(&self) -> usize {
        Arc::as_ptr(&self.target) as *const () as usize
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct DataProcessorProxy {
    object: Arc<ObjectProxy>,
}

#[async_trait]
impl DataProcessor for DataProcessorProxy {
    async fn process_vector(&self, input: Vec<i32>) -> RpcResult<Vec<i32>> {
        let encoding = self.object.service_proxy().encoding();
        let data = wire::encode(encoding, &input)?;
        let output = self
            .object
            .call(
                0,
                &data_processor_interface_id,
                data_processor_methods::PROCESS_VECTOR,
                &data,
            )
            .await?;
        wire::decode(encoding, &output.data)
    }

    async fn echo_binary(&self, payload: Vec<u8>) -> RpcResult<Vec<u8>> {
        let encoding = self.object.service_proxy().encoding();
        let data = wire::encode(encoding, &payload)?;
        let output = self
            .object
            .call(
                0,
                &data_processor_interface_id,
                data_processor_methods::ECHO_BINARY,
                &data,
            )
            .await?;
        wire::decode(encoding, &output.data)
    }
}

impl RemoteInterface for dyn DataProcessor {
    fn interface_id(protocol_version: u64) -> InterfaceOrdinal {
        data_processor_interface_id(protocol_version)
    }

    fn create_proxy(object: Arc<ObjectProxy>) -> Arc<Self> {
        Arc::new(DataProcessorProxy { object })
    }

    fn create_stub(target: Arc<Self>, object: Weak<ObjectStub>) -> Arc<dyn InterfaceStub> {
        Arc::new(DataProcessorStub { target, object })
    }

    fn from_stub(stub: &Arc<dyn InterfaceStub>) -> Option<Arc<Self>> {
        stub.as_any()
            .downcast_ref::<DataProcessorStub>()
            .map(|s| s.target.clone())
    }
}

// ============================================================================
// Directory - an interface whose methods move references across zones
// ============================================================================

pub const DIRECTORY_INTERFACE: InterfaceOrdinal = InterfaceOrdinal(0xD1EC);

pub fn directory_interface_id(_protocol_version: u64) -> InterfaceOrdinal {
    DIRECTORY_INTERFACE
}

pub mod directory_methods {
    use canopy::types::MethodId;

    pub const GET_CALCULATOR: MethodId = MethodId(1);
    pub const REGISTER_CALCULATOR: MethodId = MethodId(2);
}

#[async_trait]
pub trait Directory: Send + Sync {
    async fn get_calculator(&self) -> RpcResult<Option<Shared<dyn Calculator>>>;
    async fn register_calculator(
        &self,
        calculator: Option<Shared<dyn Calculator>>,
    ) -> RpcResult<()>;
}

#[derive(Default)]
pub struct DirectoryImpl {
    slot: Mutex<Option<Shared<dyn Calculator>>>,
}

impl DirectoryImpl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, calculator: Shared<dyn Calculator>) {
        *self.slot.lock() = Some(calculator);
    }

    pub fn clear(&self) {
        self.slot.lock().take();
    }
}

#[async_trait]
impl Directory for DirectoryImpl {
    async fn get_calculator(&self) -> RpcResult<Option<Shared<dyn Calculator>>> {
        Ok(self.slot.lock().clone())
    }

    async fn register_calculator(
        &self,
        calculator: Option<Shared<dyn Calculator>>,
    ) -> RpcResult<()> {
        *self.slot.lock() = calculator;
        Ok(())
    }
}

pub struct DirectoryStub {
    pub target: Arc<dyn Directory>,
    pub object: Weak<ObjectStub>,
}

#[async_trait]
impl InterfaceStub for DirectoryStub {
    fn interface_id(&self, protocol_version: u64) -> InterfaceOrdinal {
        directory_interface_id(protocol_version)
    }

    async fn call(
        &self,
        _protocol_version: u64,
        encoding: Encoding,
        caller_zone: CallerZoneId,
        method: MethodId,
        in_data: &[u8],
    ) -> RpcResult<Vec<u8>> {
        let object_stub = self.object.upgrade().ok_or(RpcError::ObjectGone)?;
        let service = object_stub.service().clone();
        match method {
            directory_methods::GET_CALCULATOR => {
                let result = self.target.get_calculator().await?;
                let descriptor =
                    bindings::stub_bind_out_param(&service, caller_zone, result.as_ref()).await?;
                wire::encode(encoding, &descriptor)
            }
            directory_methods::REGISTER_CALCULATOR => {
                let descriptor: InterfaceDescriptor = wire::decode(encoding, in_data)?;
                let handle = bindings::stub_bind_in_param::<dyn Calculator>(
                    &service,
                    caller_zone,
                    descriptor,
                )
                .await?;
                self.target.register_calculator(handle).await?;
                wire::encode(encoding, &())
            }
            _ => Err(RpcError::InvalidData),
        }
    }

    fn cast(&self, _interface: InterfaceOrdinal) -> RpcResult<Option<Arc<dyn InterfaceStub>>> {
        Ok(None)
    }

    fn target_address(&self) -> usize {
        Arc::as_ptr(&self.target) as *const () as usize
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct DirectoryProxy {
    object: Arc<ObjectProxy>,
}

#[async_trait]
impl Directory for DirectoryProxy {
    async fn get_calculator(&self) -> RpcResult<Option<Shared<dyn Calculator>>> {
        let encoding = self.object.service_proxy().encoding();
        let data = wire::encode(encoding, &())?;
        let output = self
            .object
            .call(
                0,
                &directory_interface_id,
                directory_methods::GET_CALCULATOR,
                &data,
            )
            .await?;
        let descriptor: InterfaceDescriptor = wire::decode(encoding, &output.data)?;
        bindings::proxy_bind_out_param(self.object.service_proxy(), descriptor).await
    }

    async fn register_calculator(
        &self,
        calculator: Option<Shared<dyn Calculator>>,
    ) -> RpcResult<()> {
        let encoding = self.object.service_proxy().encoding();
        let (descriptor, binding) =
            bindings::proxy_bind_in_param(self.object.service_proxy(), calculator.as_ref()).await?;
        let data = wire::encode(encoding, &descriptor)?;
        let result = self
            .object
            .call(
                0,
                &directory_interface_id,
                directory_methods::REGISTER_CALCULATOR,
                &data,
            )
            .await;
        if let Some(binding) = binding {
            binding.release();
        }
        let output = result?;
        wire::decode(encoding, &output.data)
    }
}

impl RemoteInterface for dyn Directory {
    fn interface_id(protocol_version: u64) -> InterfaceOrdinal {
        directory_interface_id(protocol_version)
    }

    fn create_proxy(object: Arc<ObjectProxy>) -> Arc<Self> {
        Arc::new(DirectoryProxy { object })
    }

    fn create_stub(target: Arc<Self>, object: Weak<ObjectStub>) -> Arc<dyn InterfaceStub> {
        Arc::new(DirectoryStub { target, object })
    }

    fn from_stub(stub: &Arc<dyn InterfaceStub>) -> Option<Arc<Self>> {
        stub.as_any()
            .downcast_ref::<DirectoryStub>()
            .map(|s| s.target.clone())
    }
}

// ============================================================================
// Handshake helpers
// ============================================================================

/// Connection handler that attaches the peer and serves a fixed interface
/// as this zone's root object.
pub fn serve_attach<T>(service: Arc<Service>, root: Shared<T>) -> ConnectionHandler
where
    T: RemoteInterface + ?Sized,
{
    let root = Mutex::new(Some(root));
    Arc::new(move |input, transport| {
        let service = service.clone();
        let root = root.lock().take();
        Box::pin(async move {
            let root = root.ok_or(RpcError::ZoneNotSupported)?;
            service
                .attach_remote_zone::<T, T, _, _>("peer", transport, input, move |_parent, _svc| async move {
                    Ok(root)
                })
                .await
        })
    })
}
