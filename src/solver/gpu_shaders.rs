//! WGSL compute kernels for the wgpu device.
//!
//! All vectors are `array<f32>`; CSR indices are `u32`. Element-wise
//! kernels use a grid-stride loop so the dispatch size can be capped
//! independently of `n`. The two reduction kernels (`dot_blocks`,
//! `update_pcg`) write one partial sum per workgroup; the host adds the
//! partials.

/// Threads per workgroup for element-wise kernels.
pub const ELEMENTWISE_WG: u32 = 64;

/// Threads per workgroup for the reduction kernels.
pub const REDUCTION_WG: u32 = 256;

/// WGSL source containing all kernels.
///
/// Entry points:
/// - `axpy`: y = alpha * x + beta * y (y not read when beta == 0)
/// - `dot_blocks`: per-workgroup partial sums of x . y
/// - `update_pcg`: r = r - alpha * ap, per-workgroup partial sums of r . r
/// - `spmv`: y = A * x (CSR, one row per thread)
/// - `jacobi`: z = inv_diag * r
pub const SHADER_SOURCE: &str = r#"
struct VecParams {
    alpha: f32,
    beta: f32,
    n: u32,
    pad: u32,
}

const RED_WG: u32 = 256u;
const EW_WG: u32 = 64u;

var<workgroup> red_scratch: array<f32, 256>;

// Tree reduction of red_scratch; thread 0 ends up with the block sum.
fn reduce_block(lid: u32) {
    workgroupBarrier();
    var s = RED_WG / 2u;
    while s > 0u {
        if lid < s {
            red_scratch[lid] = red_scratch[lid] + red_scratch[lid + s];
        }
        workgroupBarrier();
        s = s / 2u;
    }
}

// --- axpy: y = alpha * x + beta * y ---

@group(0) @binding(0) var<storage, read> axpy_x: array<f32>;
@group(0) @binding(1) var<storage, read_write> axpy_y: array<f32>;
@group(0) @binding(2) var<uniform> axpy_params: VecParams;

@compute @workgroup_size(64)
fn axpy(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let stride = nwg.x * EW_WG;
    for (var i = gid.x; i < axpy_params.n; i = i + stride) {
        let ax = axpy_params.alpha * axpy_x[i];
        // y may be uninitialised pool memory when beta == 0.
        if axpy_params.beta == 0.0 {
            axpy_y[i] = ax;
        } else {
            axpy_y[i] = ax + axpy_params.beta * axpy_y[i];
        }
    }
}

// --- dot_blocks: partials[wid] = sum over the block's stride of x * y ---

@group(0) @binding(0) var<storage, read> dot_x: array<f32>;
@group(0) @binding(1) var<storage, read> dot_y: array<f32>;
@group(0) @binding(2) var<storage, read_write> dot_partials: array<f32>;
@group(0) @binding(3) var<uniform> dot_params: VecParams;

@compute @workgroup_size(256)
fn dot_blocks(
    @builtin(local_invocation_id) lid: vec3<u32>,
    @builtin(workgroup_id) wid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let stride = nwg.x * RED_WG;
    var acc: f32 = 0.0;
    for (var i = wid.x * RED_WG + lid.x; i < dot_params.n; i = i + stride) {
        acc = acc + dot_x[i] * dot_y[i];
    }
    red_scratch[lid.x] = acc;
    reduce_block(lid.x);
    if lid.x == 0u {
        dot_partials[wid.x] = red_scratch[0];
    }
}

// --- update_pcg: r -= alpha * ap, partials[wid] = block sum of r^2 ---

@group(0) @binding(0) var<storage, read> upd_ap: array<f32>;
@group(0) @binding(1) var<storage, read_write> upd_r: array<f32>;
@group(0) @binding(2) var<storage, read_write> upd_partials: array<f32>;
@group(0) @binding(3) var<uniform> upd_params: VecParams;

@compute @workgroup_size(256)
fn update_pcg(
    @builtin(local_invocation_id) lid: vec3<u32>,
    @builtin(workgroup_id) wid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let stride = nwg.x * RED_WG;
    var acc: f32 = 0.0;
    for (var i = wid.x * RED_WG + lid.x; i < upd_params.n; i = i + stride) {
        let ri = upd_r[i] - upd_params.alpha * upd_ap[i];
        upd_r[i] = ri;
        acc = acc + ri * ri;
    }
    red_scratch[lid.x] = acc;
    reduce_block(lid.x);
    if lid.x == 0u {
        upd_partials[wid.x] = red_scratch[0];
    }
}

// --- spmv: y = A * x, CSR, one row per thread ---

@group(0) @binding(0) var<storage, read> spmv_values: array<f32>;
@group(0) @binding(1) var<storage, read> spmv_col_indices: array<u32>;
@group(0) @binding(2) var<storage, read> spmv_row_pointers: array<u32>;
@group(0) @binding(3) var<storage, read> spmv_x: array<f32>;
@group(0) @binding(4) var<storage, read_write> spmv_y: array<f32>;
@group(0) @binding(5) var<uniform> spmv_params: VecParams;

@compute @workgroup_size(64)
fn spmv(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let stride = nwg.x * EW_WG;
    for (var row = gid.x; row < spmv_params.n; row = row + stride) {
        let row_end = spmv_row_pointers[row + 1u];
        var sum: f32 = 0.0;
        for (var idx = spmv_row_pointers[row]; idx < row_end; idx = idx + 1u) {
            sum = sum + spmv_values[idx] * spmv_x[spmv_col_indices[idx]];
        }
        spmv_y[row] = sum;
    }
}

// --- jacobi: z[i] = inv_diag[i] * r[i] ---

@group(0) @binding(0) var<storage, read> jac_inv_diag: array<f32>;
@group(0) @binding(1) var<storage, read> jac_r: array<f32>;
@group(0) @binding(2) var<storage, read_write> jac_z: array<f32>;
@group(0) @binding(3) var<uniform> jac_params: VecParams;

@compute @workgroup_size(64)
fn jacobi(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let stride = nwg.x * EW_WG;
    for (var i = gid.x; i < jac_params.n; i = i + stride) {
        jac_z[i] = jac_inv_diag[i] * jac_r[i];
    }
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    /// Parse the WGSL with naga's frontend so this runs without a GPU.
    #[test]
    fn wgsl_parses_successfully() {
        let module = match naga::front::wgsl::parse_str(SHADER_SOURCE) {
            Ok(module) => module,
            Err(e) => panic!("WGSL parse error:\n{}", e.emit_to_string(SHADER_SOURCE)),
        };
        let entry_names: Vec<&str> = module.entry_points.iter().map(|ep| ep.name.as_str()).collect();
        for name in ["axpy", "dot_blocks", "update_pcg", "spmv", "jacobi"] {
            assert!(
                entry_names.contains(&name),
                "missing entry point: {name}. Found: {entry_names:?}"
            );
        }
    }

    #[test]
    fn workgroup_constants_match_shader() {
        assert!(SHADER_SOURCE.contains(&format!("const RED_WG: u32 = {REDUCTION_WG}u;")));
        assert!(SHADER_SOURCE.contains(&format!("const EW_WG: u32 = {ELEMENTWISE_WG}u;")));
    }
}
