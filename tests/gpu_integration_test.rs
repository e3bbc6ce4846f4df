//! GPU device tests. Each test skips itself when no adapter is available.
//!
//! The wgpu device computes in f32, so comparisons use single-precision
//! tolerances against f64 host results.

use std::sync::Arc;

use approx::assert_relative_eq;
use flexcg::solver::backend::Device;
use flexcg::solver::comm::SingleProcessComm;
use flexcg::solver::gpu::{GpuCsrOperator, GpuJacobi, WgpuDevice};
use flexcg::solver::operator::Laplacian2d;
use flexcg::solver::sparse_direct::solve_sparse_lu;
use flexcg::solver::Operator;
use flexcg::sparse::CsrMatrix;
use flexcg::{Pcg, PcgConfig, Variant};

fn gpu_device() -> Option<WgpuDevice> {
    match WgpuDevice::new() {
        Ok(device) => Some(device),
        Err(e) => {
            eprintln!("Skipping: no GPU available ({e})");
            None
        }
    }
}

macro_rules! device_or_skip {
    () => {
        match gpu_device() {
            Some(device) => device,
            None => return,
        }
    };
}

#[test]
fn axpy_and_inner_product() {
    let device = device_or_skip!();
    let n = 1000;
    let xs: Vec<f32> = (0..n).map(|k| (k % 10) as f32 * 0.1).collect();
    let ys: Vec<f32> = (0..n).map(|k| 1.0 - (k % 4) as f32 * 0.25).collect();
    let x = device.upload(&xs).unwrap();
    let mut y = device.upload(&ys).unwrap();

    let dot = device.inner_prod(n, &x, &y).unwrap();
    let expected: f64 = xs.iter().zip(&ys).map(|(a, b)| f64::from(*a) * f64::from(*b)).sum();
    assert_relative_eq!(f64::from(dot), expected, max_relative = 1e-5);

    device.axpy(n, 2.0, &x, -1.0, &mut y).unwrap();
    let out = device.download(&y).unwrap();
    for k in 0..n {
        assert_relative_eq!(out[k], 2.0 * xs[k] - ys[k], epsilon = 1e-6);
    }
}

#[test]
fn fused_update_returns_local_residual_norm() {
    let device = device_or_skip!();
    let n: usize = 3000;
    let n_blocks = n.div_ceil(512);
    let aps: Vec<f32> = (0..n).map(|k| (k % 7) as f32).collect();
    let rs: Vec<f32> = (0..n).map(|k| (k % 5) as f32 + 0.5).collect();
    let ap = device.upload(&aps).unwrap();
    let mut r = device.upload(&rs).unwrap();
    let mut partials = device.alloc_work(512).unwrap();

    let rr = device.update_pcg(n, n_blocks, 0.25, &ap, &mut r, &mut partials).unwrap();
    let updated = device.download(&r).unwrap();
    let mut expected = 0.0f64;
    for k in 0..n {
        let rk = rs[k] - 0.25 * aps[k];
        assert_relative_eq!(updated[k], rk, epsilon = 1e-5);
        expected += f64::from(rk) * f64::from(rk);
    }
    assert_relative_eq!(f64::from(rr), expected, max_relative = 1e-5);
}

#[test]
fn csr_operator_matches_host_product() {
    let device = device_or_skip!();
    let a: CsrMatrix<f32> = Laplacian2d::new(7, 5, 0.5).to_csr();
    let xs: Vec<f32> = (0..35).map(|k| k as f32 * 0.1).collect();
    let mut op = GpuCsrOperator::new(&device, &a).unwrap();
    let x = device.upload(&xs).unwrap();
    let mut y = device.alloc_work(35).unwrap();
    op.apply(&x, &mut y).unwrap();
    let out = device.download(&y).unwrap();
    for (g, h) in out.iter().zip(a.spmv(&xs)) {
        assert_relative_eq!(*g, h, epsilon = 1e-5);
    }
}

#[test]
fn gpu_pcg_solves_screened_poisson() {
    let device = device_or_skip!();
    let problem = Laplacian2d::new(16, 16, 0.2);
    let n = problem.n();
    let a: CsrMatrix<f64> = problem.to_csr();
    let b: Vec<f64> = (0..n).map(|k| 1.0 + (k % 3) as f64).collect();

    let config = PcgConfig {
        variant: Variant::Standard,
        tolerance: 1e-5,
        ..PcgConfig::default()
    };
    let mut pcg = Pcg::new(n, 0, device.clone(), Arc::new(SingleProcessComm), config).unwrap();
    let mut op = GpuCsrOperator::new(&device, &a.cast::<f32>()).unwrap();
    let mut precon = GpuJacobi::from_matrix(&device, &a, 1.0).unwrap();
    let b32: Vec<f32> = b.iter().map(|&v| v as f32).collect();
    let mut x = device.upload(&vec![0.0f32; n]).unwrap();
    let mut r = device.upload(&b32).unwrap();
    pcg.solve_with_config(&mut op, &mut precon, &mut x, &mut r).unwrap();

    let summary = pcg.last_solve().unwrap();
    assert!(summary.converged, "{summary:?}");
    assert!(!summary.precision_converted);

    let x = device.download(&x).unwrap();
    let reference = solve_sparse_lu(&a, &b).unwrap();
    for (xi, ri) in x.iter().zip(&reference) {
        assert_relative_eq!(f64::from(*xi), *ri, max_relative = 1e-3);
    }
}
