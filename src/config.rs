//! 制御ループのタイミング定数と設定パラメータ
//!
//! ここの定数は制御周期・PWM周期から導出される値で、コンパイル時に固定される。
//! 実行時に変更可能なパラメータは `params` モジュールの構造体に置く。

pub mod params;

pub use params::{MotorConfig, PositionLimitConfig, ServoConfig};

/// PWMキャリア周波数 [Hz]（センターアライメント、1周期ごとにアップデートイベント）
pub const PWM_RATE_HZ: u32 = 40_000;

/// 制御割り込みレート [Hz]
pub const INT_RATE_HZ: u32 = 40_000;

/// PWM周期あたりの割り込み間引き数（1なら毎周期制御）
pub const INTERRUPT_DIVISOR: u32 = PWM_RATE_HZ / INT_RATE_HZ;

/// 制御レート [Hz]（浮動小数点演算用）
pub const RATE_HZ: f32 = INT_RATE_HZ as f32;

/// 制御周期 [s]
pub const PERIOD_S: f32 = 1.0 / RATE_HZ;

/// 電流サンプリングに必要な時間 [s]
///
/// ローサイドFETが全相ONの間（PWM谷）にシャント電圧を変換し終える必要がある。
/// 実機のオシロスコープ計測で較正した値。
pub const CURRENT_SAMPLE_TIME_S: f32 = 1.85e-6;

/// 最小デューティ比
///
/// これを下回る（= 相補側が上回る）と電流サンプリング窓が潰れる。
pub const MIN_PWM: f32 = CURRENT_SAMPLE_TIME_S / (0.5 / PWM_RATE_HZ as f32);

/// 最大デューティ比
pub const MAX_PWM: f32 = 1.0 - MIN_PWM;

/// 電流センスオフセット較正のサンプル数
pub const CALIBRATE_COUNT: u32 = 256;

/// 1周期あたりのエンコーダ位置変化の上限 [counts]
///
/// AS5047の限界回転数28krpmをu16換算したもの。これを超える変化は
/// 読み取りエラーとみなしフォルトにする。
pub const MAX_POSITION_DELTA: i16 = (28_000 / 60 * 65_536 / INT_RATE_HZ) as i16;

/// v_per_hz未設定時に使う安全側トルク定数 [N·m/A]
pub const DEFAULT_TORQUE_CONSTANT: f32 = 0.1;

/// v_per_hz未設定時のq軸電流リミット [A]
pub const MAX_UNCONFIGURED_CURRENT_A: f32 = 5.0;

/// 速度フィルタ窓の最大長
pub const MAX_VELOCITY_FILTER: usize = 256;

/// 電気角オフセットテーブルのセクタ数（65536の2のべき乗約数）
pub const OFFSET_TABLE_SIZE: usize = 64;

/// 電流シャント抵抗 [Ω]
pub const CURRENT_SENSE_OHM: f32 = 0.0005;
