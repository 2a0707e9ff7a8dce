// 该文件是 Wangchuan （望川） 项目的一部分。
// src/pool.rs - 像素与张量缓冲池
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use tracing::debug;

/// 缓冲池槽位编号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(usize);

impl SlotId {
  pub fn index(self) -> usize {
    self.0
  }
}

/// 固定槽位数的像素缓冲池
///
/// 槽位只在遇到更大的帧时扩容，稳态下不做任何分配。
#[derive(Debug)]
pub struct BufferPool {
  slots: Vec<Vec<u8>>,
  in_use: Vec<bool>,
  grow_count: usize,
}

impl BufferPool {
  pub fn new(slots: usize, capacity: usize) -> Self {
    let slots = slots.max(1);
    Self {
      slots: (0..slots).map(|_| Vec::with_capacity(capacity)).collect(),
      in_use: vec![false; slots],
      grow_count: 0,
    }
  }

  /// 取一个空闲槽位，并把其长度设为 `len`
  pub fn acquire(&mut self, len: usize) -> Option<SlotId> {
    let index = self.in_use.iter().position(|used| !used)?;
    let buffer = &mut self.slots[index];
    if buffer.capacity() < len {
      debug!(
        "缓冲槽位 {} 扩容: {} -> {} 字节",
        index,
        buffer.capacity(),
        len
      );
      self.grow_count += 1;
    }
    buffer.resize(len, 0);
    self.in_use[index] = true;
    Some(SlotId(index))
  }

  pub fn buffer(&self, slot: SlotId) -> &[u8] {
    &self.slots[slot.0]
  }

  pub fn buffer_mut(&mut self, slot: SlotId) -> &mut [u8] {
    &mut self.slots[slot.0]
  }

  pub fn release(&mut self, slot: SlotId) {
    self.in_use[slot.0] = false;
  }

  pub fn available(&self) -> usize {
    self.in_use.iter().filter(|used| !**used).count()
  }

  pub fn len(&self) -> usize {
    self.slots.len()
  }

  pub fn is_empty(&self) -> bool {
    self.slots.is_empty()
  }

  /// 槽位扩容的累计次数
  pub fn grow_count(&self) -> usize {
    self.grow_count
  }
}

/// 模型输入张量，NHWC 排列，批大小为 1
///
/// 模型加载时分配一次，之后每帧原地覆写。
#[derive(Debug, Clone)]
pub struct Tensor {
  side: usize,
  channels: usize,
  data: Box<[f32]>,
}

impl Tensor {
  pub fn new(side: usize, channels: usize) -> Self {
    Self {
      side,
      channels,
      data: vec![0.0; side * side * channels].into_boxed_slice(),
    }
  }

  pub fn side(&self) -> usize {
    self.side
  }

  pub fn channels(&self) -> usize {
    self.channels
  }

  pub fn len(&self) -> usize {
    self.data.len()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }

  pub fn as_slice(&self) -> &[f32] {
    &self.data
  }

  pub fn as_mut_slice(&mut self) -> &mut [f32] {
    &mut self.data
  }

  /// 仅在边长变化时重新分配，返回是否发生了分配
  pub fn reshape(&mut self, side: usize) -> bool {
    if side == self.side {
      return false;
    }
    debug!("输入张量重新分配: {} -> {}", self.side, side);
    *self = Tensor::new(side, self.channels);
    true
  }
}
