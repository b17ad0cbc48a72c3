//! モーター・サーボ・位置リミットの設定構造体
//!
//! いずれも不揮発ストレージへの保存対象で、非RTコンテキストが所有する。
//! 変更後は `BldcServo::update_config()` で導出値を再計算すること。
//! `poles` やオフセットテーブルのような相互不変条件を持つフィールドは
//! `Mode::Stopped` の間にのみ更新してよい。

use crate::config::OFFSET_TABLE_SIZE;
use crate::foc::pid::PidConfig;

/// モーター固有のパラメータ（ISRからは読み取り専用）
#[derive(Debug, Clone, Copy)]
pub struct MotorConfig {
    /// 極数（極対数ではない）。0なら未設定でd/q制御はフォルトする
    pub poles: u8,

    /// センサー方向反転フラグ
    pub invert: bool,

    /// 相抵抗 [Ω]
    pub resistance_ohm: f32,

    /// 逆起電力定数 [V/Hz]（電気周波数あたり）。0なら未設定
    pub v_per_hz: f32,

    /// アンラップ位置のスケール（出力軸1回転あたりの倍率、減速機で負もあり得る）
    pub unwrapped_position_scale: f32,

    /// エンコーダゼロ点のオフセット [counts]
    pub position_offset: i32,

    /// セクタごとの電気角オフセットテーブル [rad]
    ///
    /// 磁気・機械的な非理想性の補正。較正ツールが書き込み、ISRは参照のみ。
    pub offset: [f32; OFFSET_TABLE_SIZE],

    /// トルクモデルの線形領域の上限電流 [A]
    pub rotation_current_cutoff_a: f32,

    /// 飽和領域の電流スケール
    pub rotation_current_scale: f32,

    /// 飽和領域のトルクスケール
    pub rotation_torque_scale: f32,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            poles: 0,
            invert: false,
            resistance_ohm: 0.0,
            v_per_hz: 0.0,
            unwrapped_position_scale: 1.0,
            position_offset: 0,
            offset: [0.0; OFFSET_TABLE_SIZE],
            rotation_current_cutoff_a: 10.0,
            rotation_current_scale: 0.05,
            rotation_torque_scale: 14.7,
        }
    }
}

/// サーボ制御のパラメータ
#[derive(Debug, Clone, Copy)]
pub struct ServoConfig {
    /// 電流センスアンプのゲイン
    pub i_gain: f32,

    /// バス電圧センスのスケール [V/count]
    pub v_scale_v: f32,

    /// デッドゾーン補償の最小PWMオフセット
    pub pwm_min: f32,

    /// デッドゾーン補償のブレンド幅
    pub pwm_min_blend: f32,

    /// 過電圧フォルトしきい値 [V]
    pub max_voltage: f32,

    /// 最大相電流 [A]
    pub max_current_a: f32,

    /// 熱ディレート完了時の電流上限 [A]
    pub derate_current_a: f32,

    /// 熱ディレート開始温度 [°C]
    pub derate_temperature: f32,

    /// 過熱フォルト温度 [°C]
    pub fault_temperature: f32,

    /// 電流ループのフィードフォワード係数（0で無効、1で公称）
    pub feedforward_scale: f32,

    /// 位置PIDに入れる速度の量子化ノイズしきい値 [unit/s]
    pub velocity_threshold: f32,

    /// d/q電流PIDのゲイン
    pub pid_dq: PidConfig,

    /// 位置PIDのゲイン
    pub pid_position: PidConfig,

    /// 速度フィルタの窓長（1..=256）
    pub velocity_filter_length: usize,

    /// コマンドタイムアウト後の保持トルク上限 [N·m]
    pub timeout_max_torque_nm: f32,

    /// timeout_s == 0 のコマンドに適用するデフォルトタイムアウト [s]
    pub default_timeout_s: f32,

    /// フラックスブレーキの開始バス電圧 [V]（0以下で無効）
    pub flux_brake_min_voltage: f32,

    /// フラックスブレーキの等価抵抗 [Ω]
    pub flux_brake_resistance_ohm: f32,

    /// 電流ADCのサンプルサイクル設定
    pub adc_cur_cycles: u16,

    /// 補助ADC（電圧・温度）のサンプルサイクル設定
    pub adc_aux_cycles: u16,
}

impl Default for ServoConfig {
    fn default() -> Self {
        Self {
            i_gain: 20.0,
            v_scale_v: 0.00884,
            pwm_min: 0.006,
            pwm_min_blend: 0.01,
            max_voltage: 37.0,
            max_current_a: 100.0,
            derate_current_a: 20.0,
            derate_temperature: 50.0,
            fault_temperature: 75.0,
            feedforward_scale: 1.0,
            velocity_threshold: 0.09,
            pid_dq: PidConfig {
                kp: 0.005,
                ki: 30.0,
                sign: -1.0,
                ..PidConfig::default()
            },
            pid_position: PidConfig {
                kp: 4.0,
                ki: 1.0,
                kd: 0.05,
                ilimit: 1000.0,
                sign: -1.0,
                ..PidConfig::default()
            },
            velocity_filter_length: 256,
            timeout_max_torque_nm: 0.01,
            default_timeout_s: 0.1,
            flux_brake_min_voltage: 0.0,
            flux_brake_resistance_ohm: 0.025,
            adc_cur_cycles: 2,
            adc_aux_cycles: 47,
        }
    }
}

/// ソフトウェア位置リミット
///
/// min/maxはNaNで「未設定」を表す。
#[derive(Debug, Clone, Copy)]
pub struct PositionLimitConfig {
    /// 位置の下限 [unit]（NaN = 無効）
    pub position_min: f32,

    /// 位置の上限 [unit]（NaN = 無効）
    pub position_max: f32,

    /// リミット超過時にq軸電流を0まで絞る幅 [unit]
    pub position_derate: f32,
}

impl Default for PositionLimitConfig {
    fn default() -> Self {
        Self {
            position_min: f32::NAN,
            position_max: f32::NAN,
            position_derate: 0.02,
        }
    }
}
