//! コマンドのダブルバッファ
//!
//! 2つのスロットを用意し、非RT側が「次」スロットへ書き込んでから
//! アクティブインデックスをRelease順序で入れ替える。ISRはAcquire順序で
//! インデックスを読むので、常に「完全な旧コマンド」か「完全な新コマンド」の
//! どちらかだけを観測する。ロックもアロケーションも使わない。
//!
//! 書き込みは非RTコンテキストの単一ライター、読み出しはISRの単一リーダー
//! という前提の上に成り立っている。それ以外の使い方は未定義。

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

use super::data::CommandData;

pub(crate) struct CommandBuffer {
    slots: [UnsafeCell<CommandData>; 2],
    /// ISRが読むスロットのインデックス（0か1）
    active: AtomicUsize,
}

// SAFETY: スロットへのアクセスはプロトコルで直列化されている。
// producer_slot()は非アクティブ側だけを返し、active_slot()はアクティブ側
// だけを返す。インデックスの更新はpublish()のRelease storeのみで、
// ISR側のAcquire loadと対になる。
unsafe impl Sync for CommandBuffer {}

impl CommandBuffer {
    pub fn new() -> Self {
        Self {
            slots: [
                UnsafeCell::new(CommandData::default()),
                UnsafeCell::new(CommandData::default()),
            ],
            active: AtomicUsize::new(0),
        }
    }

    /// 非RT側が書き込む「次」スロット
    ///
    /// activeを更新するのは自分だけなのでRelaxedで十分。
    pub fn producer_slot(&self) -> *mut CommandData {
        let next = 1 - self.active.load(Ordering::Relaxed);
        self.slots[next].get()
    }

    /// 書き込み済みの「次」スロットをアクティブにする
    pub fn publish(&self) {
        let next = 1 - self.active.load(Ordering::Relaxed);
        self.active.store(next, Ordering::Release);
    }

    /// ISRが読む（ワンショット消費のため書きもする）アクティブスロット
    pub fn active_slot(&self) -> *mut CommandData {
        let active = self.active.load(Ordering::Acquire);
        self.slots[active].get()
    }
}
