//! Integration tests for the cache scatter engine.

use kv_block_ops::block::fp8;
use kv_block_ops::block::layout::{FlatLayout, SplitLayout};
use kv_block_ops::{
    scatter_flat, scatter_split, transfer_blocks, CacheBuffer, CacheFormat, DType, Device,
    EngineError, ErrorKind,
};

// Geometry under test: block_size=16, heads=2, head_size=4, x=2 over
// 2 blocks (32 slots, 8 channels).
const KEY_SHAPE: [usize; 5] = [2, 2, 2, 16, 2];
const VALUE_SHAPE: [usize; 4] = [2, 2, 4, 16];
const FLAT_SHAPE: [usize; 4] = [2, 16, 2, 4];
const CHANNELS: usize = 8;

fn token_data(tokens: usize, salt: f32) -> Vec<f32> {
    (0..tokens * CHANNELS)
        .map(|i| (i / CHANNELS) as f32 * 100.0 + (i % CHANNELS) as f32 + salt)
        .collect()
}

fn download(buf: &CacheBuffer, device: &Device) -> Vec<f32> {
    let host = CacheBuffer::host(buf.dtype(), buf.shape());
    let identity: Vec<(u32, u32)> = (0..buf.shape()[0] as u32).map(|b| (b, b)).collect();
    transfer_blocks(buf, &host, &identity).unwrap();
    device.synchronize().unwrap();
    host.to_elems::<f32>().unwrap()
}

fn download_bytes(buf: &CacheBuffer, device: &Device) -> Vec<u8> {
    let host = CacheBuffer::host(buf.dtype(), buf.shape());
    let identity: Vec<(u32, u32)> = (0..buf.shape()[0] as u32).map(|b| (b, b)).collect();
    transfer_blocks(buf, &host, &identity).unwrap();
    device.synchronize().unwrap();
    host.to_elems::<u8>().unwrap()
}

#[test]
fn test_split_scatter_scenario() {
    let device = Device::new(0);
    let slots: Vec<i64> = vec![5, -1, 20];
    let k_data = token_data(3, 0.0);
    let v_data = token_data(3, 0.5);

    let keys = CacheBuffer::device_from_elems(DType::F32, &[3, 2, 4], &k_data, &device).unwrap();
    let values = CacheBuffer::device_from_elems(DType::F32, &[3, 2, 4], &v_data, &device).unwrap();
    let key_cache = CacheBuffer::device(DType::F32, &KEY_SHAPE, &device);
    let value_cache = CacheBuffer::device(DType::F32, &VALUE_SHAPE, &device);

    scatter_split(
        &keys,
        &values,
        &key_cache,
        &value_cache,
        &slots,
        CacheFormat::Native,
        1.0,
    )
    .unwrap();
    device.synchronize().unwrap();

    let layout = SplitLayout::from_shapes(&KEY_SHAPE, &VALUE_SHAPE).unwrap();
    let k_out = download(&key_cache, &device);
    let v_out = download(&value_cache, &device);

    // Token 0 lands in block 0 offset 5, token 2 in block 1 offset 4,
    // token 1 is dropped; everything else stays zero.
    let mut k_expected = vec![0.0f32; key_cache.num_elems()];
    let mut v_expected = vec![0.0f32; value_cache.num_elems()];
    for (token, slot) in [(0usize, 5usize), (2, 20)] {
        assert_eq!(slot / layout.block_size, if token == 0 { 0 } else { 1 });
        for i in 0..CHANNELS {
            k_expected[layout.key_offset(slot, i)] = k_data[token * CHANNELS + i];
            v_expected[layout.value_offset(slot, i)] = v_data[token * CHANNELS + i];
        }
    }
    assert_eq!(k_out, k_expected);
    assert_eq!(v_out, v_expected);
}

#[test]
fn test_split_readback_is_bit_exact() {
    let device = Device::new(0);
    let slots: Vec<i64> = vec![0, 7, 31];
    // Values with non-trivial mantissas.
    let k_data: Vec<f32> = (0..3 * CHANNELS).map(|i| (i as f32 + 0.1) / 3.0).collect();
    let v_data: Vec<f32> = (0..3 * CHANNELS).map(|i| (i as f32 - 7.3) / 1.7).collect();

    let keys = CacheBuffer::device_from_elems(DType::F32, &[3, 2, 4], &k_data, &device).unwrap();
    let values = CacheBuffer::device_from_elems(DType::F32, &[3, 2, 4], &v_data, &device).unwrap();
    let key_cache = CacheBuffer::device(DType::F32, &KEY_SHAPE, &device);
    let value_cache = CacheBuffer::device(DType::F32, &VALUE_SHAPE, &device);

    scatter_split(
        &keys,
        &values,
        &key_cache,
        &value_cache,
        &slots,
        CacheFormat::Native,
        1.0,
    )
    .unwrap();
    device.synchronize().unwrap();

    let layout = SplitLayout::from_shapes(&KEY_SHAPE, &VALUE_SHAPE).unwrap();
    let k_out = download(&key_cache, &device);
    let v_out = download(&value_cache, &device);

    for (token, &slot) in slots.iter().enumerate() {
        for i in 0..CHANNELS {
            let k = k_out[layout.key_offset(slot as usize, i)];
            let v = v_out[layout.value_offset(slot as usize, i)];
            assert_eq!(k.to_bits(), k_data[token * CHANNELS + i].to_bits());
            assert_eq!(v.to_bits(), v_data[token * CHANNELS + i].to_bits());
        }
    }
}

#[test]
fn test_all_negative_slots_leave_caches_unchanged() {
    let device = Device::new(0);
    let cache_fill: Vec<f32> = (0..256).map(|i| i as f32).collect();

    let keys = CacheBuffer::device(DType::F32, &[2, 2, 4], &device);
    let values = CacheBuffer::device(DType::F32, &[2, 2, 4], &device);
    let key_cache =
        CacheBuffer::device_from_elems(DType::F32, &KEY_SHAPE, &cache_fill, &device).unwrap();
    let value_cache =
        CacheBuffer::device_from_elems(DType::F32, &VALUE_SHAPE, &cache_fill, &device).unwrap();

    scatter_split(
        &keys,
        &values,
        &key_cache,
        &value_cache,
        &[-1, -2],
        CacheFormat::Native,
        1.0,
    )
    .unwrap();
    device.synchronize().unwrap();

    assert_eq!(download(&key_cache, &device), cache_fill);
    assert_eq!(download(&value_cache, &device), cache_fill);
}

#[test]
fn test_flat_scatter_and_readback() {
    let device = Device::new(0);
    let slots: Vec<i64> = vec![5, -1, 20];
    let k_data = token_data(3, 0.0);
    let v_data = token_data(3, 0.5);

    let keys = CacheBuffer::device_from_elems(DType::F32, &[3, 2, 4], &k_data, &device).unwrap();
    let values = CacheBuffer::device_from_elems(DType::F32, &[3, 2, 4], &v_data, &device).unwrap();
    let key_cache = CacheBuffer::device(DType::F32, &FLAT_SHAPE, &device);
    let value_cache = CacheBuffer::device(DType::F32, &FLAT_SHAPE, &device);

    scatter_flat(
        &keys,
        &values,
        &key_cache,
        &value_cache,
        &slots,
        CacheFormat::Native,
    )
    .unwrap();
    device.synchronize().unwrap();

    let layout = FlatLayout::from_shapes(&FLAT_SHAPE, &FLAT_SHAPE).unwrap();
    let k_out = download(&key_cache, &device);
    let v_out = download(&value_cache, &device);

    let mut k_expected = vec![0.0f32; key_cache.num_elems()];
    let mut v_expected = vec![0.0f32; value_cache.num_elems()];
    for (token, slot) in [(0usize, 5usize), (2, 20)] {
        for i in 0..CHANNELS {
            k_expected[layout.offset(slot, i)] = k_data[token * CHANNELS + i];
            v_expected[layout.offset(slot, i)] = v_data[token * CHANNELS + i];
        }
    }
    assert_eq!(k_out, k_expected);
    assert_eq!(v_out, v_expected);
}

#[test]
fn test_flat_quantization_unsupported() {
    let device = Device::new(0);
    let keys = CacheBuffer::device(DType::F32, &[1, 2, 4], &device);
    let values = CacheBuffer::device(DType::F32, &[1, 2, 4], &device);
    let key_cache = CacheBuffer::device(DType::U8, &FLAT_SHAPE, &device);
    let value_cache = CacheBuffer::device(DType::U8, &FLAT_SHAPE, &device);

    let err = scatter_flat(
        &keys,
        &values,
        &key_cache,
        &value_cache,
        &[0],
        CacheFormat::Fp8,
    )
    .unwrap_err();
    assert!(matches!(err, EngineError::FlatLayoutQuantization));
    assert_eq!(err.kind(), ErrorKind::Unsupported);

    // Nothing was enqueued; the cache is still zero-filled.
    device.synchronize().unwrap();
    assert!(download_bytes(&key_cache, &device).iter().all(|&b| b == 0));
}

#[test]
fn test_split_fp8_quantized_write() {
    let device = Device::new(0);
    let scale = 0.25f32;
    let slots: Vec<i64> = vec![3, 17];
    let k_data: Vec<f32> = (0..2 * CHANNELS).map(|i| i as f32 * 0.75 - 4.0).collect();
    let v_data: Vec<f32> = (0..2 * CHANNELS).map(|i| i as f32 * -0.5 + 2.0).collect();

    let keys = CacheBuffer::device_from_elems(DType::F32, &[2, 2, 4], &k_data, &device).unwrap();
    let values = CacheBuffer::device_from_elems(DType::F32, &[2, 2, 4], &v_data, &device).unwrap();
    let key_cache = CacheBuffer::device(DType::U8, &KEY_SHAPE, &device);
    let value_cache = CacheBuffer::device(DType::U8, &VALUE_SHAPE, &device);

    scatter_split(
        &keys,
        &values,
        &key_cache,
        &value_cache,
        &slots,
        CacheFormat::Fp8,
        scale,
    )
    .unwrap();
    device.synchronize().unwrap();

    let layout = SplitLayout::from_shapes(&KEY_SHAPE, &VALUE_SHAPE).unwrap();
    let k_out = download_bytes(&key_cache, &device);
    let v_out = download_bytes(&value_cache, &device);

    for (token, &slot) in slots.iter().enumerate() {
        for i in 0..CHANNELS {
            let expected_k = fp8::quantize(k_data[token * CHANNELS + i], scale);
            let expected_v = fp8::quantize(v_data[token * CHANNELS + i], scale);
            assert_eq!(k_out[layout.key_offset(slot as usize, i)], expected_k);
            assert_eq!(v_out[layout.value_offset(slot as usize, i)], expected_v);
        }
    }
}

#[test]
fn test_slot_out_of_range_rejected() {
    let device = Device::new(0);
    let keys = CacheBuffer::device(DType::F32, &[1, 2, 4], &device);
    let values = CacheBuffer::device(DType::F32, &[1, 2, 4], &device);
    let key_cache = CacheBuffer::device(DType::F32, &KEY_SHAPE, &device);
    let value_cache = CacheBuffer::device(DType::F32, &VALUE_SHAPE, &device);

    // 32 slots exist; slot 32 is one past the end.
    let err = scatter_split(
        &keys,
        &values,
        &key_cache,
        &value_cache,
        &[32],
        CacheFormat::Native,
        1.0,
    )
    .unwrap_err();
    assert!(matches!(err, EngineError::SlotOutOfRange { slot: 32, .. }));
}

#[test]
fn test_token_count_mismatch_rejected() {
    let device = Device::new(0);
    let keys = CacheBuffer::device(DType::F32, &[2, 2, 4], &device);
    let values = CacheBuffer::device(DType::F32, &[2, 2, 4], &device);
    let key_cache = CacheBuffer::device(DType::F32, &KEY_SHAPE, &device);
    let value_cache = CacheBuffer::device(DType::F32, &VALUE_SHAPE, &device);

    let err = scatter_split(
        &keys,
        &values,
        &key_cache,
        &value_cache,
        &[0],
        CacheFormat::Native,
        1.0,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        EngineError::TokenCountMismatch { tokens: 2, slots: 1 }
    ));
}

#[test]
fn test_host_inputs_rejected() {
    let device = Device::new(0);
    let keys = CacheBuffer::host(DType::F32, &[1, 2, 4]);
    let values = CacheBuffer::host(DType::F32, &[1, 2, 4]);
    let key_cache = CacheBuffer::device(DType::F32, &KEY_SHAPE, &device);
    let value_cache = CacheBuffer::device(DType::F32, &VALUE_SHAPE, &device);

    let err = scatter_split(
        &keys,
        &values,
        &key_cache,
        &value_cache,
        &[0],
        CacheFormat::Native,
        1.0,
    )
    .unwrap_err();
    assert!(matches!(err, EngineError::DeviceOnly { .. }));
}
