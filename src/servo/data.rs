//! 制御コアの共有データ型
//!
//! `Status` と `Control` はISRが所有し、テレメトリ側は読み取り専用。
//! `CommandData` は非RTコンテキストが生成し、ダブルバッファ経由でISRへ渡る。

use crate::foc::pid::PidState;

/// 制御モード
///
/// トルクを出すモードへは必ず `Enabling → Calibrating → CalibrationComplete`
/// の較正ゲートを通ってしか入れない。`Fault` と `PositionTimeout` からは
/// `Stopped` コマンドでしか抜けられない。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mode {
    /// 停止。ドライバ無効、PWM全相0
    #[default]
    Stopped,
    /// フォルトラッチ中
    Fault,
    /// ゲートドライバ有効化待ち（非RT側が進める）
    Enabling,
    /// 電流センスオフセット較正中
    Calibrating,
    /// 較正完了、モード遷移待ち
    CalibrationComplete,
    /// 開ループPWM
    Pwm,
    /// 開ループ相電圧
    Voltage,
    /// 開ループFOC電圧（外部指定の電気角）
    VoltageFoc,
    /// d/q電圧
    VoltageDq,
    /// d/q電流閉ループ
    Current,
    /// 位置制御
    Position,
    /// コマンドタイムアウト後の保持（ZeroVelocity相当、停止でのみ解除）
    PositionTimeout,
    /// 速度0保持
    ZeroVelocity,
    /// 範囲内保持
    StayWithinBounds,
}

impl Mode {
    /// このモードでインバータがトルクを出しているか
    pub fn torque_on(self) -> bool {
        match self {
            Mode::Stopped
            | Mode::Fault
            | Mode::Enabling
            | Mode::Calibrating
            | Mode::CalibrationComplete => false,
            Mode::Pwm
            | Mode::Voltage
            | Mode::VoltageFoc
            | Mode::VoltageDq
            | Mode::Current
            | Mode::Position
            | Mode::PositionTimeout
            | Mode::ZeroVelocity
            | Mode::StayWithinBounds => true,
        }
    }

    /// 電流PIDが生きているモードか
    pub fn current_pid_active(self) -> bool {
        matches!(
            self,
            Mode::Current
                | Mode::Position
                | Mode::PositionTimeout
                | Mode::ZeroVelocity
                | Mode::StayWithinBounds
        )
    }

    /// 位置PIDが生きているモードか
    pub fn position_pid_active(self) -> bool {
        matches!(
            self,
            Mode::Position | Mode::PositionTimeout | Mode::ZeroVelocity | Mode::StayWithinBounds
        )
    }
}

/// フォルトコード
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ErrorCode {
    #[default]
    Success,
    /// ADC変換完了前にハイサイドゲートが開いた（デューティ超過）
    PwmCycleOverrun,
    /// エンコーダの1周期あたり変化量が物理限界を超えた
    EncoderFault,
    /// 較正中の電流オフセットがミッドスケールから外れすぎ
    CalibrationFault,
    /// ゲートドライバICのフォルト出力
    MotorDriverFault,
    OverVoltage,
    OverTemperature,
    /// 位置リミット外から位置系モードに入ろうとした
    StartOutsideLimit,
    /// poles == 0 のままd/q制御を要求された
    MotorNotConfigured,
}

/// `command()` の拒否理由
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandError {
    /// ISR内部専用のモードは外部から要求できない
    InvalidMode(Mode),
}

/// 非RT側からISRへ渡る1サイクル分の指令
///
/// `position` / `stop_position` / `bounds_*` はNaNで「未指定」を表す。
/// `set_position` / `rezero_position` と `position` はワンショットで、
/// ISRが適用時にクリアするため、スワップが繰り返されても再適用されない。
#[derive(Debug, Clone, Copy)]
pub struct CommandData {
    pub mode: Mode,

    /// 開ループPWMの3相デューティ
    pub pwm: [f32; 3],

    /// 開ループの3相電圧 [V]
    pub phase_v: [f32; 3],

    /// VoltageFoc用の電気角 [rad]
    pub theta: f32,
    /// VoltageFoc用の電圧振幅 [V]
    pub voltage: f32,

    /// VoltageDq用のd/q電圧 [V]
    pub d_v: f32,
    pub q_v: f32,

    /// Current用のd/q電流設定値 [A]
    pub i_d_a: f32,
    pub i_q_a: f32,

    /// 位置目標 [unit]（NaN = 現在のcontrol_positionを維持）
    pub position: f32,
    /// 速度指令 [unit/s]
    pub velocity: f32,

    /// トルク上限 [N·m]
    pub max_torque_nm: f32,
    /// フィードフォワードトルク [N·m]
    pub feedforward_nm: f32,
    /// 位置PIDのゲインスケール
    pub kp_scale: f32,
    pub kd_scale: f32,

    /// ここで停止する位置 [unit]（NaN = なし）
    pub stop_position: f32,

    /// StayWithinBounds用の範囲 [unit]（NaN = 片側無効）
    pub bounds_min: f32,
    pub bounds_max: f32,

    /// ウォッチドッグタイムアウト [s]。0はデフォルト値に置換、NaNは無効
    pub timeout_s: f32,

    /// アンラップ位置を直接書き換える [unit]（ワンショット）
    pub set_position: Option<f32>,

    /// 最も近い整数回転を選んでゼロ点を再設定する [unit]（ワンショット）
    pub rezero_position: Option<f32>,
}

impl Default for CommandData {
    fn default() -> Self {
        Self {
            mode: Mode::Stopped,
            pwm: [0.0; 3],
            phase_v: [0.0; 3],
            theta: 0.0,
            voltage: 0.0,
            d_v: 0.0,
            q_v: 0.0,
            i_d_a: 0.0,
            i_q_a: 0.0,
            position: f32::NAN,
            velocity: 0.0,
            max_torque_nm: 100.0,
            feedforward_nm: 0.0,
            kp_scale: 1.0,
            kd_scale: 1.0,
            stop_position: f32::NAN,
            bounds_min: f32::NAN,
            bounds_max: f32::NAN,
            timeout_s: 0.0,
            set_position: None,
            rezero_position: None,
        }
    }
}

/// ISRが公開する状態（テレメトリの主対象）
#[derive(Debug, Clone, Copy)]
pub struct Status {
    pub mode: Mode,
    pub fault: ErrorCode,

    // ADC生値
    pub adc_cur1_raw: u16,
    pub adc_cur2_raw: u16,
    pub adc_cur3_raw: u16,
    pub adc_voltage_sense_raw: u16,
    pub adc_fet_temp_raw: u16,
    pub adc_motor_temp_raw: u16,

    // 較正で決まる電流オフセット
    pub adc_cur1_offset: u16,
    pub adc_cur2_offset: u16,
    pub adc_cur3_offset: u16,

    /// 相電流 [A]
    pub cur1_a: f32,
    pub cur2_a: f32,
    pub cur3_a: f32,

    /// バス電圧 [V]（瞬時値と2本のIIRフィルタ値）
    pub bus_v: f32,
    pub filt_bus_v: f32,
    pub filt_1ms_bus_v: f32,

    /// 測定されたd/q電流 [A]
    pub d_a: f32,
    pub q_a: f32,
    /// q軸電流からのトルク推定 [N·m]
    pub torque_nm: f32,

    /// 電気角のsin/cos
    pub sin: f32,
    pub cos: f32,

    /// エンコーダ生値とinvert適用後の位置
    pub position_raw: u16,
    pub position: u16,
    /// 電気角 [rad]（オフセットテーブル適用後）
    pub electrical_theta: f32,

    /// アンラップ位置 [counts]（int32アキュムレータ）
    pub unwrapped_position_raw: i32,
    /// アンラップ位置 [unit]
    pub unwrapped_position: f32,
    /// 速度 [unit/s]
    pub velocity: f32,

    /// 温度 [°C]
    pub fet_temp_c: f32,
    pub motor_temp_c: f32,

    /// rezero要求のラッチ（NaN = なし）
    pub position_to_set: f32,
    /// rezeroが完了したことを示すフラグ
    pub rezeroed: bool,

    /// ウォッチドッグの残り時間 [s]
    pub timeout_s: f32,

    /// 位置制御の内部目標位置 [unit]（NaN = 未初期化）
    pub control_position: f32,

    /// 較正の進行カウント
    pub calibration_count: u32,

    // PID内部状態（テレメトリ用に公開）
    pub pid_d: PidState,
    pub pid_q: PidState,
    pub pid_position: PidState,

    /// ISR完了時点のPWM周期内カウント（余裕の計測用）
    pub final_timer: u32,
    pub total_timer: u32,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            mode: Mode::Stopped,
            fault: ErrorCode::Success,
            adc_cur1_raw: 0,
            adc_cur2_raw: 0,
            adc_cur3_raw: 0,
            adc_voltage_sense_raw: 0,
            adc_fet_temp_raw: 0,
            adc_motor_temp_raw: 0,
            // 未較正でも 0A 相当になるミッドスケール
            adc_cur1_offset: 2048,
            adc_cur2_offset: 2048,
            adc_cur3_offset: 2048,
            cur1_a: 0.0,
            cur2_a: 0.0,
            cur3_a: 0.0,
            bus_v: 0.0,
            filt_bus_v: f32::NAN,
            filt_1ms_bus_v: f32::NAN,
            d_a: 0.0,
            q_a: 0.0,
            torque_nm: 0.0,
            sin: 0.0,
            cos: 1.0,
            position_raw: 0,
            position: 0,
            electrical_theta: 0.0,
            unwrapped_position_raw: 0,
            unwrapped_position: 0.0,
            velocity: 0.0,
            fet_temp_c: 0.0,
            motor_temp_c: 0.0,
            position_to_set: f32::NAN,
            rezeroed: false,
            timeout_s: 0.0,
            control_position: f32::NAN,
            calibration_count: 0,
            pid_d: PidState::default(),
            pid_q: PidState::default(),
            pid_position: PidState::default(),
            final_timer: 0,
            total_timer: 0,
        }
    }
}

/// 1サイクルの制御出力（毎サイクル冒頭でクリアされる）
#[derive(Debug, Clone, Copy, Default)]
pub struct Control {
    /// 3相デューティ比（クランプ後）
    pub pwm: [f32; 3],
    /// 3相電圧指令 [V]
    pub voltage: [f32; 3],
    /// d/q電圧指令 [V]
    pub d_v: f32,
    pub q_v: f32,
    /// ディレート適用後のd/q電流指令 [A]
    pub i_d_a: f32,
    pub i_q_a: f32,
    /// トルク指令 [N·m]
    pub torque_nm: f32,
}

impl Control {
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_activity_by_mode() {
        // 電流PIDは位置系+Currentで生存、位置PIDは位置系のみ
        assert!(Mode::Current.current_pid_active());
        assert!(!Mode::Current.position_pid_active());
        assert!(Mode::PositionTimeout.current_pid_active());
        assert!(Mode::PositionTimeout.position_pid_active());
        assert!(!Mode::VoltageDq.current_pid_active());
        assert!(!Mode::Stopped.torque_on());
        assert!(Mode::Pwm.torque_on());
    }

    #[test]
    fn test_command_defaults_are_inert() {
        let cmd = CommandData::default();
        assert_eq!(cmd.mode, Mode::Stopped);
        assert!(cmd.position.is_nan());
        assert!(cmd.stop_position.is_nan());
        assert!(cmd.set_position.is_none());
        assert!(cmd.rezero_position.is_none());
    }
}
