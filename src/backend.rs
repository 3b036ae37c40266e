//! 計算バックエンドの型定義
//!
//! - CPU: NdArray
//! - GPU: WGPU（`wgpu` feature）
//!
//! 学習時は `Train<B>` で自動微分を有効化します。

use burn_ndarray::{NdArray, NdArrayDevice};

use crate::model::DeviceType;

/// CPUバックエンド
pub type CpuBackend = NdArray<f32>;

/// GPUバックエンド
#[cfg(feature = "wgpu")]
pub type GpuBackend = burn_wgpu::Wgpu;

/// 学習用（自動微分付き）バックエンド
pub type Train<B> = burn_autodiff::Autodiff<B>;

/// CPUデバイス
pub fn cpu_device() -> NdArrayDevice {
    NdArrayDevice::Cpu
}

/// GPUデバイス
///
/// `use_gpu` が偽の場合はWGPUのCPU実装を使います。
#[cfg(feature = "wgpu")]
pub fn gpu_device(use_gpu: bool) -> burn_wgpu::WgpuDevice {
    if use_gpu {
        burn_wgpu::WgpuDevice::DiscreteGpu(0)
    } else {
        burn_wgpu::WgpuDevice::Cpu
    }
}

/// 設定されたデバイスがこのビルドで使えるか
pub fn is_available(device_type: &DeviceType) -> bool {
    match device_type {
        DeviceType::Cpu => true,
        DeviceType::Wgpu => cfg!(feature = "wgpu"),
    }
}
