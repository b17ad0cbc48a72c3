//! BLDCサーボ制御コア
//!
//! PWMタイマーのアップデートイベントに同期して、電流・電圧・温度・
//! エンコーダのサンプリング → 状態推定 → モード別制御 → PWM出力までを
//! 1周期内で完結させる。`isr_update()` をタイマー割り込みから、
//! `command()` / `poll_millisecond()` を非RTコンテキストから呼ぶ。
//!
//! ISRと非RT側の共有はすべてロックフリー：コマンドはダブルバッファの
//! ポインタスワップ、`Status` は単一ライター（ISR）/単一リーダー、
//! tickカウンタとstartupカウンタはアトミック。ファームウェアに組み込む
//! ときは両コンテキストから届く `&mut` の排他を組み込み側（割り込み優先度
//! とクリティカルセクション）で保証すること。

pub(crate) mod command;
pub mod data;

mod control;
mod estimator;
mod sampler;

use core::f32::consts::PI;
use core::sync::atomic::{AtomicU32, Ordering};

use libm::fabsf;

use crate::config::{
    MotorConfig, PositionLimitConfig, ServoConfig, CURRENT_SENSE_OHM, DEFAULT_TORQUE_CONSTANT,
    INTERRUPT_DIVISOR, MAX_VELOCITY_FILTER,
};
use crate::fmt::*;
use crate::foc::torque_model::{TorqueModel, TORQUE_CONSTANT_FUDGE};
use crate::hardware::{
    DebugDac, MillisecondTimer, MotorDriver, PositionSensor, PwmDriver, ServoAdc, TempChannel,
};

use command::CommandBuffer;
use data::{CommandData, CommandError, Control, Mode, Status};
use estimator::WindowedVelocity;

/// サーボ制御コア本体
///
/// ペリフェラルとコラボレータはトレイト実装として所有する。
pub struct BldcServo<PWM, ADC, ENC, DRV, DAC = ()> {
    pub(crate) pwm: PWM,
    pub(crate) adc: ADC,
    pub(crate) encoder: ENC,
    pub(crate) driver: DRV,
    pub(crate) dac: DAC,

    pub(crate) motor: MotorConfig,
    pub(crate) config: ServoConfig,
    pub(crate) position_config: PositionLimitConfig,

    pub(crate) commands: CommandBuffer,
    /// テレメトリ用の最終コマンドのコピー（ISRは読まない）
    pub(crate) telemetry_command: CommandData,

    pub(crate) status: Status,
    pub(crate) control: Control,

    pub(crate) velocity_filter: WindowedVelocity,

    /// 較正中の電流生値アキュムレータ
    pub(crate) calibrate_adc: [u32; 3],

    /// 次周期に読む温度チャネル
    pub(crate) aux_channel: TempChannel,

    /// 割り込み間引き用の位相カウンタ
    pub(crate) phase: u32,

    clock: AtomicU32,
    startup_count: AtomicU32,
    started: bool,

    // 設定から導出されるキャッシュ値（update_configで再計算）
    pub(crate) torque_constant: f32,
    pub(crate) position_constant: i32,
    pub(crate) adc_scale: f32,
}

impl<PWM, ADC, ENC, DRV, DAC> BldcServo<PWM, ADC, ENC, DRV, DAC>
where
    PWM: PwmDriver,
    ADC: ServoAdc,
    ENC: PositionSensor,
    DRV: MotorDriver,
    DAC: DebugDac,
{
    pub fn new(
        pwm: PWM,
        adc: ADC,
        encoder: ENC,
        driver: DRV,
        dac: DAC,
        motor: MotorConfig,
        config: ServoConfig,
        position_config: PositionLimitConfig,
    ) -> Self {
        let mut servo = Self {
            pwm,
            adc,
            encoder,
            driver,
            dac,
            motor,
            config,
            position_config,
            commands: CommandBuffer::new(),
            telemetry_command: CommandData::default(),
            status: Status::default(),
            control: Control::default(),
            velocity_filter: WindowedVelocity::new(MAX_VELOCITY_FILTER),
            calibrate_adc: [0; 3],
            aux_channel: TempChannel::Fet,
            phase: 0,
            clock: AtomicU32::new(0),
            startup_count: AtomicU32::new(0),
            started: false,
            torque_constant: DEFAULT_TORQUE_CONSTANT,
            position_constant: 0,
            adc_scale: 0.0,
        };
        servo.update_config();
        servo
    }

    /// ペリフェラルを初期化して制御ループを起動する
    ///
    /// 2回呼ぶのは契約違反。
    pub fn start(&mut self, timer: &mut dyn MillisecondTimer) {
        assert!(!self.started);
        self.started = true;

        self.adc.initialize(timer);
        self.adc
            .set_sample_cycles(self.config.adc_cur_cycles, self.config.adc_aux_cycles);
        self.adc.select_temp_channel(self.aux_channel);
        self.pwm.start();
        info!("servo control loop started");
    }

    /// 指令を発行する（非RTコンテキスト専用）
    ///
    /// ISR内部専用のモード（Fault / Enabling / Calibrating /
    /// CalibrationComplete）は拒否する。
    pub fn command(&mut self, data: &CommandData) -> Result<(), CommandError> {
        match data.mode {
            Mode::Fault | Mode::Enabling | Mode::Calibrating | Mode::CalibrationComplete => {
                debug!("command rejected: internal mode {:?}", data.mode);
                return Err(CommandError::InvalidMode(data.mode));
            }
            _ => {}
        }

        // SAFETY: 非RT側の単一ライターとして非アクティブスロットへ書く
        let next = unsafe { &mut *self.commands.producer_slot() };
        *next = *data;

        // 位置未指定でstop_positionと速度だけが来た場合、実際に動き出せる
        // ように速度の符号をstop_position側へ向ける
        if next.position.is_nan()
            && !next.stop_position.is_nan()
            && !next.velocity.is_nan()
            && next.velocity != 0.0
        {
            next.velocity = fabsf(next.velocity)
                * if next.stop_position > self.status.unwrapped_position {
                    1.0
                } else {
                    -1.0
                };
        }

        if next.timeout_s == 0.0 {
            next.timeout_s = self.config.default_timeout_s;
        }

        self.telemetry_command = *next;
        self.commands.publish();
        Ok(())
    }

    /// 1msごとの非RTティック
    ///
    /// `Enabling` を観測したらゲートドライバを有効化して較正へ進める。
    /// startupカウンタは起動直後のエンコーダ無効期間（10ms）の判定に使う。
    pub fn poll_millisecond(&mut self) {
        if self.status.mode == Mode::Enabling {
            self.driver.enable(true);
            self.status.mode = Mode::Calibrating;
            info!("gate driver enabled, current offset calibration starting");
        }
        self.startup_count.fetch_add(1, Ordering::Relaxed);
    }

    /// PWMタイマーのアップデートイベント割り込みから呼ぶ
    ///
    /// 変換開始を最優先で行い、間引き対象の周期なら即リターンする
    /// （開始済みの変換は捨てられる）。
    pub fn isr_update(&mut self) {
        self.adc.start_conversions();

        if INTERRUPT_DIVISOR != 1 {
            self.phase = (self.phase + 1) % INTERRUPT_DIVISOR;
            if self.phase != 0 {
                return;
            }
        }

        // SAFETY: ISRの単一リーダーとしてアクティブスロットを参照する。
        // ワンショットフィールドの消費のため可変で借りる。
        let data = unsafe { &mut *self.commands.active_slot() };

        let delta_position = self.isr_do_sense(data);
        let sin_cos = self.isr_estimate(delta_position);
        self.isr_do_control(&sin_cos, data);

        self.clock.fetch_add(1, Ordering::Relaxed);

        let (elapsed, total) = self.pwm.cycle_position();
        self.status.final_timer = elapsed;
        self.status.total_timer = total;
    }

    /// 設定変更後に呼んで導出値を再計算する
    ///
    /// `poles` やオフセットテーブルのような相互不変条件を持つフィールドを
    /// 変えた場合は `Mode::Stopped` の間に呼ぶこと。
    pub fn update_config(&mut self) {
        self.torque_constant = if self.is_torque_constant_configured() {
            let kv = 0.5 * 60.0 / self.motor.v_per_hz;
            TORQUE_CONSTANT_FUDGE * 60.0 / (2.0 * PI * kv)
        } else {
            DEFAULT_TORQUE_CONSTANT
        };

        self.position_constant = self.motor.poles as i32 / 2;

        self.adc_scale = 3.3 / (4096.0 * CURRENT_SENSE_OHM * self.config.i_gain);

        let length = self.config.velocity_filter_length.clamp(1, MAX_VELOCITY_FILTER);
        self.velocity_filter.set_length(length);

        debug!(
            "config updated: poles={} torque_constant={}",
            self.motor.poles, self.torque_constant
        );
    }

    pub fn is_torque_constant_configured(&self) -> bool {
        self.motor.v_per_hz != 0.0
    }

    pub(crate) fn torque_model(&self) -> TorqueModel {
        TorqueModel::new(
            self.torque_constant,
            self.motor.rotation_current_cutoff_a,
            self.motor.rotation_current_scale,
            self.motor.rotation_torque_scale,
        )
    }

    pub fn current_to_torque(&self, current: f32) -> f32 {
        self.torque_model().current_to_torque(current)
    }

    pub fn torque_to_current(&self, torque: f32) -> f32 {
        self.torque_model().torque_to_current(torque)
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn control(&self) -> &Control {
        &self.control
    }

    pub fn config(&self) -> &ServoConfig {
        &self.config
    }

    pub fn motor(&self) -> &MotorConfig {
        &self.motor
    }

    pub fn position_config(&self) -> &PositionLimitConfig {
        &self.position_config
    }

    /// テレメトリ用の最終コマンドのコピー
    pub fn telemetry_command(&self) -> &CommandData {
        &self.telemetry_command
    }

    pub fn config_mut(&mut self) -> &mut ServoConfig {
        &mut self.config
    }

    pub fn motor_mut(&mut self) -> &mut MotorConfig {
        &mut self.motor
    }

    pub fn position_config_mut(&mut self) -> &mut PositionLimitConfig {
        &mut self.position_config
    }

    /// ISRが公開する単調増加のtickカウンタ
    pub fn clock(&self) -> u32 {
        self.clock.load(Ordering::Relaxed)
    }

    pub(crate) fn startup_count(&self) -> u32 {
        self.startup_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::data::ErrorCode;
    use super::*;
    use crate::config::{MAX_PWM, MIN_PWM};
    use crate::hardware::AuxSample;
    use approx::assert_relative_eq;

    struct MockPwm {
        duty: [f32; 3],
        outputs_high: bool,
        started: bool,
    }

    impl PwmDriver for MockPwm {
        fn start(&mut self) {
            self.started = true;
        }

        fn set_duty(&mut self, a: f32, b: f32, c: f32) {
            self.duty = [a, b, c];
        }

        fn any_output_high(&self) -> bool {
            self.outputs_high
        }
    }

    struct MockAdc {
        currents: [u16; 3],
        voltage_raw: u16,
        fet_temp_raw: u16,
        motor_temp_raw: u16,
        selected: TempChannel,
        conversions: u32,
        initialized: bool,
    }

    impl ServoAdc for MockAdc {
        fn initialize(&mut self, timer: &mut dyn MillisecondTimer) {
            timer.wait_us(20);
            self.initialized = true;
        }

        fn set_sample_cycles(&mut self, _current: u16, _aux: u16) {}

        fn start_conversions(&mut self) {
            self.conversions += 1;
        }

        fn finish_currents(&mut self) -> [u16; 3] {
            self.currents
        }

        fn finish_aux(&mut self) -> AuxSample {
            AuxSample {
                voltage_raw: self.voltage_raw,
                temp_raw: match self.selected {
                    TempChannel::Fet => self.fet_temp_raw,
                    TempChannel::Motor => self.motor_temp_raw,
                },
            }
        }

        fn select_temp_channel(&mut self, channel: TempChannel) {
            self.selected = channel;
        }
    }

    struct MockEncoder {
        position: u16,
    }

    impl PositionSensor for MockEncoder {
        fn start_sample(&mut self) {}

        fn finish_sample(&mut self) -> u16 {
            self.position
        }
    }

    struct MockDriver {
        enabled: bool,
        powered: bool,
        fault_active: bool,
    }

    impl MotorDriver for MockDriver {
        fn enable(&mut self, enable: bool) {
            self.enabled = enable;
        }

        fn power(&mut self, power: bool) {
            self.powered = power;
        }

        fn fault(&mut self) -> bool {
            self.fault_active
        }
    }

    struct MockTimer;

    impl MillisecondTimer for MockTimer {
        fn wait_us(&mut self, _us: u32) {}
    }

    type TestServo = BldcServo<MockPwm, MockAdc, MockEncoder, MockDriver, ()>;

    fn make_servo() -> TestServo {
        let motor = MotorConfig {
            poles: 14,
            v_per_hz: 0.1,
            ..Default::default()
        };
        let mut servo = BldcServo::new(
            MockPwm {
                duty: [0.0; 3],
                outputs_high: false,
                started: false,
            },
            MockAdc {
                currents: [2048; 3],
                // 2715 counts × 0.00884 V/count ≒ 24V
                voltage_raw: 2715,
                fet_temp_raw: 1024,
                motor_temp_raw: 1024,
                selected: TempChannel::Fet,
                conversions: 0,
                initialized: false,
            },
            MockEncoder { position: 0 },
            MockDriver {
                enabled: false,
                powered: false,
                fault_active: false,
            },
            (),
            motor,
            ServoConfig::default(),
            PositionLimitConfig::default(),
        );
        servo.start(&mut MockTimer);
        servo
    }

    /// 較正ゲートを通してコマンドのモードまで進める
    fn run_to_mode(servo: &mut TestServo, cmd: &CommandData) {
        servo.command(cmd).unwrap();

        servo.isr_update();
        assert_eq!(servo.status().mode, Mode::Enabling);

        servo.poll_millisecond();
        assert!(servo.driver.enabled);
        assert_eq!(servo.status().mode, Mode::Calibrating);

        for _ in 0..256 {
            servo.isr_update();
        }
        assert_eq!(servo.status().mode, Mode::CalibrationComplete);

        servo.isr_update();
        assert_eq!(servo.status().mode, cmd.mode);
    }

    #[test]
    fn test_cold_start_to_stopped() {
        let mut servo = make_servo();
        assert!(servo.pwm.started);
        assert!(servo.adc.initialized);

        servo
            .command(&CommandData {
                mode: Mode::Stopped,
                ..Default::default()
            })
            .unwrap();
        servo.isr_update();

        assert_eq!(servo.status().mode, Mode::Stopped);
        assert_eq!(servo.pwm.duty, [0.0; 3]);
        assert!(!servo.driver.enabled);
        assert!(!servo.driver.powered);
        assert_eq!(servo.clock(), 1);
    }

    #[test]
    fn test_command_rejects_internal_modes() {
        let mut servo = make_servo();
        for mode in [
            Mode::Fault,
            Mode::Enabling,
            Mode::Calibrating,
            Mode::CalibrationComplete,
        ] {
            let result = servo.command(&CommandData {
                mode,
                ..Default::default()
            });
            assert_eq!(result, Err(CommandError::InvalidMode(mode)));
        }
    }

    #[test]
    fn test_calibration_path() {
        let mut servo = make_servo();
        servo.adc.currents = [2050, 2045, 2052];

        run_to_mode(
            &mut servo,
            &CommandData {
                mode: Mode::Current,
                i_d_a: 0.0,
                i_q_a: 0.0,
                ..Default::default()
            },
        );

        assert_eq!(servo.status().adc_cur1_offset, 2050);
        assert_eq!(servo.status().adc_cur2_offset, 2045);
        assert_eq!(servo.status().adc_cur3_offset, 2052);
        assert!(servo.driver.powered);
        // オフセット較正後の電流はほぼ0A
        assert!(servo.status().cur1_a.abs() < 1e-3);
    }

    #[test]
    fn test_calibration_fault_on_bad_offsets() {
        let mut servo = make_servo();
        // ミッドスケールから200カウント以上外れている
        servo.adc.currents = [2500, 2048, 2048];

        servo
            .command(&CommandData {
                mode: Mode::Current,
                ..Default::default()
            })
            .unwrap();
        servo.isr_update();
        servo.poll_millisecond();
        for _ in 0..256 {
            servo.isr_update();
        }

        assert_eq!(servo.status().mode, Mode::Fault);
        assert_eq!(servo.status().fault, ErrorCode::CalibrationFault);
    }

    #[test]
    fn test_pwm_cycle_overrun_faults_same_cycle() {
        let mut servo = make_servo();
        run_to_mode(
            &mut servo,
            &CommandData {
                mode: Mode::VoltageFoc,
                theta: 0.0,
                voltage: 1.0,
                ..Default::default()
            },
        );
        assert!(servo.driver.powered);

        servo.pwm.outputs_high = true;
        servo.isr_update();

        assert_eq!(servo.status().mode, Mode::Fault);
        assert_eq!(servo.status().fault, ErrorCode::PwmCycleOverrun);
        assert_eq!(servo.pwm.duty, [0.0; 3]);
        assert!(!servo.driver.powered);
    }

    #[test]
    fn test_fault_is_sticky_until_stopped() {
        let mut servo = make_servo();
        run_to_mode(
            &mut servo,
            &CommandData {
                mode: Mode::VoltageFoc,
                voltage: 1.0,
                ..Default::default()
            },
        );

        servo.pwm.outputs_high = true;
        servo.isr_update();
        servo.pwm.outputs_high = false;

        // フォルト中はアクティブモードの要求を無視する
        servo
            .command(&CommandData {
                mode: Mode::VoltageFoc,
                voltage: 1.0,
                ..Default::default()
            })
            .unwrap();
        for _ in 0..10 {
            servo.isr_update();
        }
        assert_eq!(servo.status().mode, Mode::Fault);
        assert_eq!(servo.status().fault, ErrorCode::PwmCycleOverrun);

        servo
            .command(&CommandData {
                mode: Mode::Stopped,
                ..Default::default()
            })
            .unwrap();
        servo.isr_update();
        assert_eq!(servo.status().mode, Mode::Stopped);
        assert_eq!(servo.status().fault, ErrorCode::Success);
    }

    #[test]
    fn test_open_loop_pwm_channel_swap() {
        let mut servo = make_servo();
        run_to_mode(
            &mut servo,
            &CommandData {
                mode: Mode::Pwm,
                pwm: [0.3, 0.4, 0.45],
                ..Default::default()
            },
        );

        // 出力2と出力3は入れ替えて書かれる
        assert_relative_eq!(servo.pwm.duty[0], 0.3);
        assert_relative_eq!(servo.pwm.duty[1], 0.45);
        assert_relative_eq!(servo.pwm.duty[2], 0.4);
    }

    #[test]
    fn test_pwm_always_within_sampling_bounds() {
        let mut servo = make_servo();
        run_to_mode(
            &mut servo,
            &CommandData {
                mode: Mode::Voltage,
                phase_v: [50.0, -50.0, 0.0],
                ..Default::default()
            },
        );

        for duty in servo.control().pwm {
            assert!(duty >= MIN_PWM && duty <= MAX_PWM);
        }
        // 0Vの相はデューティ0.5に座る
        assert_relative_eq!(servo.control().pwm[2], 0.5);
    }

    #[test]
    fn test_voltage_dq_unconfigured_motor_faults() {
        let mut servo = make_servo();
        servo.motor_mut().poles = 0;
        servo.update_config();

        servo
            .command(&CommandData {
                mode: Mode::VoltageDq,
                d_v: 0.0,
                q_v: 1.0,
                ..Default::default()
            })
            .unwrap();
        servo.isr_update();
        servo.poll_millisecond();
        // 較正は通るが、VoltageDqに入った周期でフォルトする
        for _ in 0..257 {
            servo.isr_update();
        }

        assert_eq!(servo.status().mode, Mode::Fault);
        assert_eq!(servo.status().fault, ErrorCode::MotorNotConfigured);
    }

    #[test]
    fn test_position_clamp_with_stop_position() {
        let mut servo = make_servo();
        servo.position_config_mut().position_max = 10.0;

        run_to_mode(
            &mut servo,
            &CommandData {
                mode: Mode::Position,
                position: 1.0,
                velocity: 2.0,
                stop_position: 1.5,
                timeout_s: f32::NAN,
                ..Default::default()
            },
        );

        // 1周期で velocity/rate = 5e-5 だけ進む
        assert_relative_eq!(servo.status().control_position, 1.00005, max_relative = 1e-6);

        for _ in 0..10_000 {
            servo.isr_update();
        }
        // stop_positionで飽和し、それ以上は進まない
        assert_relative_eq!(servo.status().control_position, 1.5);
        servo.isr_update();
        assert_relative_eq!(servo.status().control_position, 1.5);
    }

    #[test]
    fn test_over_temperature_derates_current() {
        let mut servo = make_servo();
        // 2048 counts → 63.33°C。ディレート帯のちょうど中央に置く
        servo.adc.fet_temp_raw = 2048;
        servo.adc.motor_temp_raw = 2048;
        servo.config_mut().derate_temperature = 53.33;
        servo.config_mut().fault_temperature = 73.33;

        run_to_mode(
            &mut servo,
            &CommandData {
                mode: Mode::Current,
                i_q_a: 100.0,
                ..Default::default()
            },
        );

        // max_current + 0.5·(derate_current − max_current) = 60A
        assert_relative_eq!(servo.control().i_q_a, 60.0, max_relative = 1e-3);
    }

    #[test]
    fn test_over_temperature_faults() {
        let mut servo = make_servo();
        run_to_mode(
            &mut servo,
            &CommandData {
                mode: Mode::Current,
                ..Default::default()
            },
        );

        // 3200 counts → 103°C、fault_temperature 75°Cを超える
        servo.adc.fet_temp_raw = 3200;
        servo.adc.motor_temp_raw = 3200;
        servo.isr_update();
        servo.isr_update();

        assert_eq!(servo.status().mode, Mode::Fault);
        assert_eq!(servo.status().fault, ErrorCode::OverTemperature);
    }

    #[test]
    fn test_over_voltage_faults() {
        let mut servo = make_servo();
        servo.config_mut().max_voltage = 20.0;

        // バスは24V相当なのでEnablingに入った周期で即フォルトする
        servo
            .command(&CommandData {
                mode: Mode::Voltage,
                ..Default::default()
            })
            .unwrap();
        servo.isr_update();

        assert_eq!(servo.status().mode, Mode::Fault);
        assert_eq!(servo.status().fault, ErrorCode::OverVoltage);
    }

    #[test]
    fn test_motor_driver_fault() {
        let mut servo = make_servo();
        run_to_mode(
            &mut servo,
            &CommandData {
                mode: Mode::Current,
                ..Default::default()
            },
        );

        servo.driver.fault_active = true;
        servo.isr_update();

        assert_eq!(servo.status().mode, Mode::Fault);
        assert_eq!(servo.status().fault, ErrorCode::MotorDriverFault);
    }

    #[test]
    fn test_encoder_delta_fault() {
        let mut servo = make_servo();
        run_to_mode(
            &mut servo,
            &CommandData {
                mode: Mode::Current,
                ..Default::default()
            },
        );

        // 1周期で5000カウントのジャンプは28krpm相当を超える
        servo.encoder.position = servo.encoder.position.wrapping_add(5000);
        servo.isr_update();

        assert_eq!(servo.status().mode, Mode::Fault);
        assert_eq!(servo.status().fault, ErrorCode::EncoderFault);
    }

    #[test]
    fn test_command_timeout_to_position_timeout() {
        let mut servo = make_servo();
        servo
            .command(&CommandData {
                mode: Mode::Position,
                timeout_s: 0.01,
                ..Default::default()
            })
            .unwrap();

        // 較正ゲートを経てPositionへ
        servo.isr_update();
        servo.poll_millisecond();
        for _ in 0..257 {
            servo.isr_update();
        }
        assert_eq!(servo.status().mode, Mode::Position);

        // 0.01s × 40kHz ≒ 400周期でウォッチドッグ満了（丸め誤差で±1周期）
        for _ in 0..160 {
            servo.isr_update();
        }
        assert_eq!(servo.status().mode, Mode::PositionTimeout);

        // Positionの再要求では抜けられない
        servo
            .command(&CommandData {
                mode: Mode::Position,
                timeout_s: 0.01,
                ..Default::default()
            })
            .unwrap();
        for _ in 0..10 {
            servo.isr_update();
        }
        assert_eq!(servo.status().mode, Mode::PositionTimeout);

        // Stoppedでのみ解除
        servo
            .command(&CommandData {
                mode: Mode::Stopped,
                ..Default::default()
            })
            .unwrap();
        servo.isr_update();
        assert_eq!(servo.status().mode, Mode::Stopped);
    }

    #[test]
    fn test_zero_timeout_gets_default() {
        let mut servo = make_servo();
        servo
            .command(&CommandData {
                mode: Mode::Position,
                timeout_s: 0.0,
                ..Default::default()
            })
            .unwrap();
        assert_relative_eq!(servo.telemetry_command().timeout_s, 0.1);
    }

    #[test]
    fn test_velocity_sign_points_toward_stop_position() {
        let mut servo = make_servo();
        servo
            .command(&CommandData {
                mode: Mode::Position,
                position: f32::NAN,
                velocity: 3.0,
                stop_position: -2.0,
                ..Default::default()
            })
            .unwrap();
        assert_relative_eq!(servo.telemetry_command().velocity, -3.0);
    }

    #[test]
    fn test_unwrapped_position_reconstruction() {
        let mut servo = make_servo();
        servo
            .command(&CommandData {
                mode: Mode::Stopped,
                ..Default::default()
            })
            .unwrap();

        for _ in 0..200 {
            servo.encoder.position = servo.encoder.position.wrapping_add(500);
            servo.isr_update();
        }

        // ドリフトなしで累積し、mod 65536はエンコーダ位置と一致する
        assert_eq!(servo.status().unwrapped_position_raw, 100_000);
        assert_eq!(
            servo.status().unwrapped_position_raw as u16,
            servo.status().position
        );
        assert_relative_eq!(
            servo.status().unwrapped_position,
            100_000.0 / 65536.0,
            max_relative = 1e-6
        );
    }

    #[test]
    fn test_windowed_velocity_estimate() {
        let mut servo = make_servo();
        servo
            .command(&CommandData {
                mode: Mode::Stopped,
                ..Default::default()
            })
            .unwrap();

        for _ in 0..300 {
            servo.encoder.position = servo.encoder.position.wrapping_add(655);
            servo.isr_update();
        }

        // 655 counts/tick × 40kHz / 65536 ≒ 399.8 unit/s
        assert_relative_eq!(
            servo.status().velocity,
            655.0 * 40_000.0 / 65536.0,
            max_relative = 1e-4
        );
    }

    #[test]
    fn test_rezero_picks_nearest_rotation() {
        let mut servo = make_servo();
        // 起動直後10msはエンコーダ無効なのでカウンタを進めておく
        for _ in 0..12 {
            servo.poll_millisecond();
        }

        servo
            .command(&CommandData {
                mode: Mode::Stopped,
                rezero_position: Some(1.25),
                ..Default::default()
            })
            .unwrap();
        servo.isr_update();

        // 1.25回転の要求に対し、最も近い整数回転は1回転
        assert!(servo.status().rezeroed);
        assert_relative_eq!(servo.status().unwrapped_position, 1.0);

        // ワンショットなので再適用されない
        servo.isr_update();
        assert_relative_eq!(servo.status().unwrapped_position, 1.0);
    }

    #[test]
    fn test_set_position_oneshot() {
        let mut servo = make_servo();
        servo
            .command(&CommandData {
                mode: Mode::Stopped,
                set_position: Some(2.0),
                ..Default::default()
            })
            .unwrap();
        servo.isr_update();
        assert_eq!(servo.status().unwrapped_position_raw, 131_072);

        // スケール値は次の周期の推定で反映される
        servo.isr_update();
        assert_relative_eq!(servo.status().unwrapped_position, 2.0);
    }

    #[test]
    fn test_start_outside_limit_faults() {
        let mut servo = make_servo();
        servo.position_config_mut().position_min = -1.0;
        servo.position_config_mut().position_max = 1.0;

        // リミット外(2.0)に置いてから位置モードを要求する
        servo
            .command(&CommandData {
                mode: Mode::Stopped,
                set_position: Some(2.0),
                ..Default::default()
            })
            .unwrap();
        servo.isr_update();

        servo
            .command(&CommandData {
                mode: Mode::Position,
                ..Default::default()
            })
            .unwrap();
        servo.isr_update();
        servo.poll_millisecond();
        for _ in 0..257 {
            servo.isr_update();
        }

        assert_eq!(servo.status().mode, Mode::Fault);
        assert_eq!(servo.status().fault, ErrorCode::StartOutsideLimit);
    }

    #[test]
    fn test_stay_within_bounds_inside_is_passive() {
        let mut servo = make_servo();
        run_to_mode(
            &mut servo,
            &CommandData {
                mode: Mode::StayWithinBounds,
                bounds_min: -1.0,
                bounds_max: 1.0,
                timeout_s: f32::NAN,
                ..Default::default()
            },
        );

        // 範囲内では位置PIDを使わずトルク0
        assert_relative_eq!(servo.control().torque_nm, 0.0);
        assert!(servo.status().control_position.is_nan());

        // 上限を超えると境界を目標に位置制御が立ち上がる
        for _ in 0..110 {
            servo.encoder.position = servo.encoder.position.wrapping_add(700);
            servo.isr_update();
        }
        assert!(servo.status().unwrapped_position > 1.0);
        assert_relative_eq!(servo.status().control_position, 1.0);
    }

    #[test]
    fn test_mode_reentry_clears_pid_state() {
        let mut servo = make_servo();
        run_to_mode(
            &mut servo,
            &CommandData {
                mode: Mode::Current,
                i_q_a: 10.0,
                ..Default::default()
            },
        );
        for _ in 0..50 {
            servo.isr_update();
        }
        assert!(servo.status().pid_q.integral != 0.0);

        // 別のアクティブモードへ遷移するとPID状態は消える
        servo
            .command(&CommandData {
                mode: Mode::VoltageDq,
                q_v: 0.5,
                ..Default::default()
            })
            .unwrap();
        servo.isr_update();
        assert_eq!(servo.status().mode, Mode::VoltageDq);
        assert_eq!(servo.status().pid_q.integral, 0.0);
    }
}
