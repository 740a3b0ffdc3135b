//! Typed failure domains.
//!
//! [`EvaluatorError`] covers precondition failures that leave the evaluator
//! untouched; [`DeviceError`] covers non-success statuses from the compute
//! API. Both convert into [`anyhow::Error`] for the public surface and stay
//! downcastable for callers that need to branch on the kind.

use crate::evaluator::ResultKey;
use gfx_hal::{
    buffer::CreationError as BufferCreationError,
    device::{
        AllocationError, BindError, CreationError as DeviceCreationError, DeviceLost, MapError,
        OutOfMemory, WaitError,
    },
    image::{CreationError as ImageCreationError, ViewCreationError},
    pso::{AllocationError as DescriptorAllocationError, CreationError as PipelineCreationError},
};

/// Precondition failures. The operation performed no work and allocated no
/// handle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum EvaluatorError {
    #[error("network has no layers")]
    EmptyNetwork,
    #[error("input length {len} is not a positive multiple of the network input count {input_count}")]
    InputSize { len: usize, input_count: usize },
    #[error("expected output length {len} does not match {expected} ({run_count} passes)")]
    ExpectedOutputSize {
        len: usize,
        expected: usize,
        run_count: usize,
    },
    #[error("unknown result key {0}")]
    UnknownResult(ResultKey),
    #[error("result key {0} is not an evaluation result")]
    NotAnEvalResult(ResultKey),
    #[error("result key {0} is not a backpropagation result")]
    NotABackpropResult(ResultKey),
    #[error("result key {0} is still in flight")]
    ResultNotReady(ResultKey),
    #[error("pass belongs to a different network")]
    NetworkMismatch,
    #[error("unknown pass token")]
    UnknownPass,
    #[error("dataset is missing its {0} group")]
    MissingGroup(&'static str),
    #[error("evaluator is already in training mode")]
    AlreadyTraining,
}

/// Fatal conditions raised by the compute API. Out-of-memory variants double
/// as the resource-exhaustion kind; everything else means the device failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum DeviceError {
    #[error("no suitable compute device")]
    NoSuitableDevice,
    #[error("host memory exhausted")]
    OutOfHostMemory,
    #[error("device memory exhausted")]
    OutOfDeviceMemory,
    #[error("no compatible memory type for the requested allocation")]
    NoCompatibleMemory,
    #[error("too many objects")]
    TooManyObjects,
    #[error("device initialization failed")]
    InitializationFailed,
    #[error("a required device feature is missing")]
    MissingFeature,
    #[error("shader compilation failed for entry \"{0}\"")]
    ShaderCompilationFailed(&'static str),
    #[error("shader binary is not valid SPIR-V")]
    InvalidShader,
    #[error("memory mapping failed")]
    MappingFailed,
    #[error("the device panicked or disconnected")]
    DeviceLost,
}

impl From<OutOfMemory> for DeviceError {
    fn from(from: OutOfMemory) -> Self {
        match from {
            OutOfMemory::Host => Self::OutOfHostMemory,
            OutOfMemory::Device => Self::OutOfDeviceMemory,
        }
    }
}

impl From<DeviceLost> for DeviceError {
    fn from(_from: DeviceLost) -> Self {
        Self::DeviceLost
    }
}

impl From<WaitError> for DeviceError {
    fn from(from: WaitError) -> Self {
        match from {
            WaitError::OutOfMemory(out_of_memory) => out_of_memory.into(),
            WaitError::DeviceLost(device_lost) => device_lost.into(),
        }
    }
}

impl From<DeviceCreationError> for DeviceError {
    fn from(from: DeviceCreationError) -> Self {
        match from {
            DeviceCreationError::OutOfMemory(out_of_memory) => out_of_memory.into(),
            DeviceCreationError::InitializationFailed => Self::InitializationFailed,
            DeviceCreationError::MissingFeature => Self::MissingFeature,
            DeviceCreationError::TooManyObjects => Self::TooManyObjects,
            DeviceCreationError::DeviceLost => Self::DeviceLost,
        }
    }
}

impl From<BufferCreationError> for DeviceError {
    fn from(from: BufferCreationError) -> Self {
        match from {
            BufferCreationError::OutOfMemory(out_of_memory) => out_of_memory.into(),
            BufferCreationError::UnsupportedUsage { .. } => Self::InitializationFailed,
        }
    }
}

impl From<ImageCreationError> for DeviceError {
    fn from(from: ImageCreationError) -> Self {
        match from {
            ImageCreationError::OutOfMemory(out_of_memory) => out_of_memory.into(),
            _ => Self::InitializationFailed,
        }
    }
}

impl From<ViewCreationError> for DeviceError {
    fn from(from: ViewCreationError) -> Self {
        match from {
            ViewCreationError::OutOfMemory(out_of_memory) => out_of_memory.into(),
            _ => Self::InitializationFailed,
        }
    }
}

impl From<AllocationError> for DeviceError {
    fn from(from: AllocationError) -> Self {
        match from {
            AllocationError::OutOfMemory(out_of_memory) => out_of_memory.into(),
            AllocationError::TooManyObjects => Self::TooManyObjects,
        }
    }
}

impl From<DescriptorAllocationError> for DeviceError {
    fn from(from: DescriptorAllocationError) -> Self {
        match from {
            DescriptorAllocationError::OutOfMemory(out_of_memory) => out_of_memory.into(),
            _ => Self::TooManyObjects,
        }
    }
}

impl From<BindError> for DeviceError {
    fn from(from: BindError) -> Self {
        match from {
            BindError::OutOfMemory(out_of_memory) => out_of_memory.into(),
            BindError::WrongMemory | BindError::OutOfBounds => Self::NoCompatibleMemory,
        }
    }
}

impl From<MapError> for DeviceError {
    fn from(from: MapError) -> Self {
        match from {
            MapError::OutOfMemory(out_of_memory) => out_of_memory.into(),
            _ => Self::MappingFailed,
        }
    }
}

impl From<PipelineCreationError> for DeviceError {
    fn from(from: PipelineCreationError) -> Self {
        match from {
            PipelineCreationError::OutOfMemory(out_of_memory) => out_of_memory.into(),
            _ => Self::InitializationFailed,
        }
    }
}
