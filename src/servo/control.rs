//! モード別制御ステージ
//!
//! モード状態機械の更新、フォルト条件の監視、選択されたモードの制御則の
//! 実行までを受け持つ。どの経路を通っても、最終的な電圧は電流サンプリング
//! 余裕を守る± (0.5 − MIN_PWM)·バス電圧 に、デューティは
//! [MIN_PWM, MAX_PWM] にクランプされてから出力される。

use crate::config::{
    CALIBRATE_COUNT, MAX_PWM, MAX_UNCONFIGURED_CURRENT_A, MIN_PWM, PERIOD_S, RATE_HZ,
};
use crate::fmt::*;
use crate::foc::pid::ApplyOptions;
use crate::foc::transforms::{inverse_dq_transform, sin_cos, SinCos};
use crate::hardware::{DebugDac, MotorDriver, PositionSensor, PwmDriver, ServoAdc};

use super::data::{CommandData, ErrorCode, Mode};
use super::BldcServo;

/// NaNを「制限なし」として扱うクランプ
///
/// `f32::clamp` はNaN境界でパニックするのでここでは使えない。
pub(crate) fn limit(value: f32, min: f32, max: f32) -> f32 {
    let mut v = value;
    if v < min {
        v = min;
    }
    if v > max {
        v = max;
    }
    v
}

/// (lower, upper) の範囲内を0に潰すしきい値関数
///
/// 速度の量子化ノイズが位置PIDのD項を震わせるのを抑える。
fn threshold(value: f32, lower: f32, upper: f32) -> f32 {
    if value > lower && value < upper {
        return 0.0;
    }
    value
}

/// 符号付きデッドゾーン補償
///
/// 0はそのまま0、|val| >= blend なら ±minval の段差を足し、
/// その間は線形にブレンドする。
fn dead_zone_offset(minval: f32, blend: f32, val: f32) -> f32 {
    if val == 0.0 {
        return 0.0;
    }
    if libm::fabsf(val) >= blend {
        return if val < 0.0 { -minval + val } else { minval + val };
    }
    let ratio = val / blend;
    ratio * (blend + minval)
}

/// PID状態のクリア方針
#[derive(Clone, Copy, PartialEq)]
pub(crate) enum ClearMode {
    /// そのPIDを使わないモードのときだけクリア
    IfModeInactive,
    /// 無条件にクリア（モード遷移時）
    Always,
}

impl<PWM, ADC, ENC, DRV, DAC> BldcServo<PWM, ADC, ENC, DRV, DAC>
where
    PWM: PwmDriver,
    ADC: ServoAdc,
    ENC: PositionSensor,
    DRV: MotorDriver,
    DAC: DebugDac,
{
    /// フォルトをラッチする。最初の原因コードを保持する。
    pub(crate) fn isr_fault(&mut self, code: ErrorCode) {
        if self.status.mode != Mode::Fault {
            self.status.mode = Mode::Fault;
            self.status.fault = code;
            warn!("fault latched: {:?}", code);
        }
    }

    /// 制御ステージ本体（毎有効周期、推定の後に走る）
    pub(crate) fn isr_do_control(&mut self, sin_cos: &SinCos, data: &mut CommandData) {
        self.control.clear();

        if let Some(set_position) = data.set_position.take() {
            self.status.unwrapped_position_raw = (set_position * 65536.0) as i32;
        }

        if !self.status.timeout_s.is_nan() && self.status.timeout_s > 0.0 {
            self.status.timeout_s = (self.status.timeout_s - PERIOD_S).max(0.0);
        }

        if data.mode != self.status.mode {
            self.isr_maybe_change_mode(data);
        }

        // 常時監視するフォルト条件
        if self.status.mode != Mode::Stopped && self.status.mode != Mode::Fault {
            if self.driver.fault() {
                self.isr_fault(ErrorCode::MotorDriverFault);
            }
            if self.status.bus_v > self.config.max_voltage {
                self.isr_fault(ErrorCode::OverVoltage);
            }
            if self.status.fet_temp_c > self.config.fault_temperature {
                self.isr_fault(ErrorCode::OverTemperature);
            }
        }

        // ウォッチドッグ満了：Stoppedでしか抜けられない保持モードへ落とす
        if (self.status.mode == Mode::Position || self.status.mode == Mode::StayWithinBounds)
            && !self.status.timeout_s.is_nan()
            && self.status.timeout_s <= 0.0
        {
            self.status.mode = Mode::PositionTimeout;
            warn!("command timeout, holding at zero velocity");
        }

        // 使っていないPIDの状態をゼロに保つ
        self.isr_clear_pid(ClearMode::IfModeInactive);

        if self.status.mode != Mode::Fault {
            self.status.fault = ErrorCode::Success;
        }

        match self.status.mode {
            Mode::Stopped => self.isr_do_stopped(),
            Mode::Fault => self.isr_do_fault(),
            Mode::Enabling | Mode::CalibrationComplete => {}
            Mode::Calibrating => self.isr_do_calibrating(),
            Mode::Pwm => self.isr_do_pwm_control(data.pwm),
            Mode::Voltage => self.isr_do_voltage_control(data.phase_v),
            Mode::VoltageFoc => self.isr_do_voltage_foc(data.theta, data.voltage),
            Mode::VoltageDq => self.isr_do_voltage_dq(sin_cos, data.d_v, data.q_v),
            Mode::Current => self.isr_do_current(sin_cos, data.i_d_a, data.i_q_a),
            Mode::Position => self.isr_do_position(sin_cos, data),
            Mode::PositionTimeout | Mode::ZeroVelocity => self.isr_do_zero_velocity(sin_cos, data),
            Mode::StayWithinBounds => self.isr_do_stay_within_bounds(sin_cos, data),
        }
    }

    /// 要求モードと現在モードが違うとき、進められるところまで進める
    fn isr_maybe_change_mode(&mut self, data: &mut CommandData) {
        match data.mode {
            // command()で拒否されるため現れない
            Mode::Fault | Mode::Calibrating | Mode::CalibrationComplete => {}

            // Stoppedへはどこからでも入れる
            Mode::Stopped => {
                debug!("servo mode {:?} -> Stopped", self.status.mode);
                self.status.mode = Mode::Stopped;
            }

            // EnablingはISRからは進められない（非RT側の仕事）
            Mode::Enabling => {}

            Mode::Pwm
            | Mode::Voltage
            | Mode::VoltageFoc
            | Mode::VoltageDq
            | Mode::Current
            | Mode::Position
            | Mode::PositionTimeout
            | Mode::ZeroVelocity
            | Mode::StayWithinBounds => {
                match self.status.mode {
                    // フォルトから直接アクティブモードへは行けない
                    Mode::Fault => {}

                    // 停止状態からはまず較正ゲートを通る
                    Mode::Stopped => self.isr_start_calibrating(),

                    // 較正が終わるまで待つ
                    Mode::Enabling | Mode::Calibrating => {}

                    // タイムアウト保持はStopped以外では抜けられない
                    Mode::PositionTimeout => {}

                    Mode::CalibrationComplete
                    | Mode::Pwm
                    | Mode::Voltage
                    | Mode::VoltageFoc
                    | Mode::VoltageDq
                    | Mode::Current
                    | Mode::Position
                    | Mode::ZeroVelocity
                    | Mode::StayWithinBounds => {
                        if (data.mode == Mode::Position || data.mode == Mode::StayWithinBounds)
                            && self.is_outside_limits()
                        {
                            self.isr_fault(ErrorCode::StartOutsideLimit);
                        } else {
                            debug!("servo mode {:?} -> {:?}", self.status.mode, data.mode);
                            self.status.mode = data.mode;

                            // 新しいモードは素の状態から始める
                            self.isr_clear_pid(ClearMode::Always);
                        }
                    }
                }
            }
        }
    }

    fn is_outside_limits(&self) -> bool {
        (!self.position_config.position_min.is_nan()
            && self.status.unwrapped_position < self.position_config.position_min)
            || (!self.position_config.position_max.is_nan()
                && self.status.unwrapped_position > self.position_config.position_max)
    }

    /// 較正ゲートの入口：出力を落としてEnablingへ
    ///
    /// ゲートドライバの有効化は非RT側の `poll_millisecond()` が行い、
    /// 完了したらCalibratingへ書き換えてくれる。
    fn isr_start_calibrating(&mut self) {
        self.status.mode = Mode::Enabling;

        self.pwm.set_duty(0.0, 0.0, 0.0);

        // この時点でPowerは必ずfalseのはずだが、確実に落としておく
        self.driver.power(false);

        self.calibrate_adc = [0; 3];
        self.status.calibration_count = 0;
        debug!("entering calibration gate");
    }

    /// 使っていないPIDの状態を消す
    ///
    /// `Always` はモード遷移時で、電流制御は常に0A指令から始める。
    pub(crate) fn isr_clear_pid(&mut self, clear: ClearMode) {
        let always = clear == ClearMode::Always;

        if always || !self.status.mode.current_pid_active() {
            self.status.pid_d.clear();
            self.status.pid_q.clear();
            self.status.pid_d.desired = 0.0;
            self.status.pid_q.desired = 0.0;
        }

        if always || !self.status.mode.position_pid_active() {
            self.status.pid_position.clear();
            self.status.control_position = f32::NAN;
        }
    }

    fn isr_do_stopped(&mut self) {
        self.driver.enable(false);
        self.driver.power(false);
        self.pwm.set_duty(0.0, 0.0, 0.0);
    }

    fn isr_do_fault(&mut self) {
        self.driver.power(false);
        self.pwm.set_duty(0.0, 0.0, 0.0);
    }

    /// 電流センスオフセットの較正
    ///
    /// 無通電状態で生値を平均し、ミッドスケール近傍であることを検証する。
    fn isr_do_calibrating(&mut self) {
        self.calibrate_adc[0] += self.status.adc_cur1_raw as u32;
        self.calibrate_adc[1] += self.status.adc_cur2_raw as u32;
        self.calibrate_adc[2] += self.status.adc_cur3_raw as u32;
        self.status.calibration_count += 1;

        if self.status.calibration_count < CALIBRATE_COUNT {
            return;
        }

        let offset1 = (self.calibrate_adc[0] / CALIBRATE_COUNT) as u16;
        let offset2 = (self.calibrate_adc[1] / CALIBRATE_COUNT) as u16;
        let offset3 = (self.calibrate_adc[2] / CALIBRATE_COUNT) as u16;

        if (offset1 as i32 - 2048).abs() > 200
            || (offset2 as i32 - 2048).abs() > 200
            || (offset3 as i32 - 2048).abs() > 200
        {
            error!(
                "current offset calibration failed: {} {} {}",
                offset1, offset2, offset3
            );
            self.isr_fault(ErrorCode::CalibrationFault);
            return;
        }

        self.status.adc_cur1_offset = offset1;
        self.status.adc_cur2_offset = offset2;
        self.status.adc_cur3_offset = offset3;
        self.status.mode = Mode::CalibrationComplete;
        info!(
            "current offsets calibrated: {} {} {}",
            offset1, offset2, offset3
        );
    }

    /// デューティをクランプしてコンペアレジスタへ書く
    fn isr_do_pwm_control(&mut self, pwm: [f32; 3]) {
        self.control.pwm = [
            self.limit_pwm(pwm[0]),
            self.limit_pwm(pwm[1]),
            self.limit_pwm(pwm[2]),
        ];

        // 出力2と出力3はあえて入れ替える。電流読みの相入れ替えと対で、
        // 順序を戻すと既設モーターの位置符号が反転する。
        self.pwm.set_duty(self.control.pwm[0], self.control.pwm[2], self.control.pwm[1]);

        self.driver.power(true);
    }

    /// 相電圧をデッドゾーン補償込みでデューティへ写像する
    fn voltage_to_pwm(&self, v: f32) -> f32 {
        0.5 + dead_zone_offset(
            self.config.pwm_min,
            self.config.pwm_min_blend,
            v / self.status.filt_bus_v,
        )
    }

    fn isr_do_voltage_control(&mut self, voltage: [f32; 3]) {
        self.control.voltage = voltage;

        self.isr_do_pwm_control([
            self.voltage_to_pwm(voltage[0]),
            self.voltage_to_pwm(voltage[1]),
            self.voltage_to_pwm(voltage[2]),
        ]);
    }

    /// 外部指定の電気角での開ループFOC電圧
    fn isr_do_voltage_foc(&mut self, theta: f32, voltage: f32) {
        let sc = sin_cos(theta);
        let max_voltage = (0.5 - MIN_PWM) * self.status.filt_bus_v;
        let (a, b, c) =
            inverse_dq_transform(&sc, 0.0, limit(voltage, -max_voltage, max_voltage));
        self.isr_do_voltage_control([a, b, c]);
    }

    fn isr_do_voltage_dq(&mut self, sin_cos: &SinCos, d_v: f32, q_v: f32) {
        if self.motor.poles == 0 {
            // モーター諸元が未設定のままd/qを回すことはできない
            self.isr_fault(ErrorCode::MotorNotConfigured);
            return;
        }

        self.control.d_v = d_v;
        self.control.q_v = q_v;

        let max_voltage = (0.5 - MIN_PWM) * self.status.filt_bus_v;
        let (a, b, c) = inverse_dq_transform(
            sin_cos,
            limit(d_v, -max_voltage, max_voltage),
            limit(q_v, -max_voltage, max_voltage),
        );

        self.isr_do_voltage_control([a, b, c]);
    }

    /// d/q電流閉ループ
    fn isr_do_current(&mut self, sin_cos: &SinCos, i_d_a_in: f32, i_q_a_in: f32) {
        // 位置リミットを超えてさらに外へ押すq電流を、超過量に応じて絞る。
        // フィードフォワードが乗っているときに意味を持つ。
        let mut i_q_a = i_q_a_in;
        if !self.position_config.position_max.is_nan()
            && self.status.unwrapped_position > self.position_config.position_max
            && i_q_a > 0.0
        {
            i_q_a *= (1.0
                - (self.status.unwrapped_position - self.position_config.position_max)
                    / self.position_config.position_derate)
                .max(0.0);
        }
        if !self.position_config.position_min.is_nan()
            && self.status.unwrapped_position < self.position_config.position_min
            && i_q_a < 0.0
        {
            i_q_a *= (1.0
                - (self.position_config.position_min - self.status.unwrapped_position)
                    / self.position_config.position_derate)
                .max(0.0);
        }

        // 熱ディレート：derate温度からfault温度にかけて電流上限を
        // max_current_a → derate_current_a まで線形に落とす
        let derate_fraction = (self.status.fet_temp_c - self.config.derate_temperature)
            / (self.config.fault_temperature - self.config.derate_temperature);
        let temp_limit_a = self.config.max_current_a.min(
            (derate_fraction * (self.config.derate_current_a - self.config.max_current_a)
                + self.config.max_current_a)
                .max(0.0),
        );

        let i_q_a = limit(i_q_a, -temp_limit_a, temp_limit_a);
        let i_d_a = limit(i_d_a_in, -temp_limit_a, temp_limit_a);

        self.control.i_d_a = i_d_a;
        self.control.i_q_a = i_q_a;

        let measured_d = self.status.d_a;
        let measured_q = self.status.q_a;

        // d軸だけはmeasured_rate=1.0を渡す（q軸は0.0）。
        let d_v = self.config.feedforward_scale * i_d_a * self.motor.resistance_ohm
            + self.config.pid_dq.apply(
                &mut self.status.pid_d,
                measured_d,
                i_d_a,
                1.0,
                0.0,
                RATE_HZ,
                &ApplyOptions::default(),
            );

        let q_v = self.config.feedforward_scale
            * (i_q_a * self.motor.resistance_ohm
                - self.status.velocity * self.motor.v_per_hz
                    / self.motor.unwrapped_position_scale)
            + self.config.pid_dq.apply(
                &mut self.status.pid_q,
                measured_q,
                i_q_a,
                0.0,
                0.0,
                RATE_HZ,
                &ApplyOptions::default(),
            );

        self.isr_do_voltage_dq(sin_cos, d_v, q_v);
    }

    fn isr_do_position(&mut self, sin_cos: &SinCos, data: &mut CommandData) {
        let options = ApplyOptions {
            kp_scale: data.kp_scale,
            kd_scale: data.kd_scale,
        };
        let max_torque_nm = data.max_torque_nm;
        let feedforward_nm = data.feedforward_nm;
        let velocity = data.velocity;

        self.isr_do_position_common(sin_cos, data, &options, max_torque_nm, feedforward_nm, velocity);
    }

    /// ZeroVelocityとPositionTimeoutの共通実装
    ///
    /// P項を切ったダンパとして現在位置付近に保持する。
    fn isr_do_zero_velocity(&mut self, sin_cos: &SinCos, data: &mut CommandData) {
        let options = ApplyOptions {
            kp_scale: 0.0,
            kd_scale: 1.0,
        };

        self.isr_do_position_common(
            sin_cos,
            data,
            &options,
            self.config.timeout_max_torque_nm,
            0.0,
            0.0,
        );
    }

    fn isr_do_position_common(
        &mut self,
        sin_cos: &SinCos,
        data: &mut CommandData,
        options: &ApplyOptions,
        max_torque_nm: f32,
        feedforward_nm: f32,
        velocity: f32,
    ) {
        if !data.position.is_nan() {
            // 新しい位置指令はワンショットで取り込む
            self.status.control_position = data.position;
            data.position = f32::NAN;
        } else if self.status.control_position.is_nan() {
            // モード再突入直後は現在位置から始める
            self.status.control_position = self.status.unwrapped_position;
        }

        let mut velocity_command = velocity;

        let old_position = self.status.control_position;
        self.status.control_position = limit(
            self.status.control_position + velocity_command / RATE_HZ,
            self.position_config.position_min,
            self.position_config.position_max,
        );
        if !data.stop_position.is_nan()
            && (self.status.control_position - data.stop_position) * velocity_command > 0.0
        {
            // stop_positionを通り過ぎようとしている。そこに張り付ける。
            self.status.control_position = data.stop_position;
        }
        if self.status.control_position == old_position {
            // リミットに当たって進めていない。速度0としてワインドアップを防ぐ。
            velocity_command = 0.0;
        }

        let measured_velocity = threshold(
            self.status.velocity,
            -self.config.velocity_threshold,
            self.config.velocity_threshold,
        );

        let measured_position = self.status.unwrapped_position;
        let control_position = self.status.control_position;

        let unlimited_torque_nm = self.config.pid_position.apply(
            &mut self.status.pid_position,
            measured_position,
            control_position,
            measured_velocity,
            velocity_command,
            RATE_HZ,
            options,
        ) + feedforward_nm;

        let limited_torque_nm = limit(unlimited_torque_nm, -max_torque_nm, max_torque_nm);
        self.control.torque_nm = limited_torque_nm;

        let limited_q_a =
            self.torque_to_current(limited_torque_nm * self.motor.unwrapped_position_scale);

        let q_a = if self.is_torque_constant_configured() {
            limited_q_a
        } else {
            // トルク定数が未設定なら安全側の電流でクリップ
            limit(
                limited_q_a,
                -MAX_UNCONFIGURED_CURRENT_A,
                MAX_UNCONFIGURED_CURRENT_A,
            )
        };

        // フラックスブレーキ：バス電圧がしきい値を超えた分を
        // d軸電流としてモーターに捨てる
        let d_a = if self.config.flux_brake_min_voltage <= 0.0 {
            0.0
        } else {
            let error = self.status.filt_1ms_bus_v - self.config.flux_brake_min_voltage;
            if error <= 0.0 {
                0.0
            } else {
                error / self.config.flux_brake_resistance_ohm
            }
        };

        self.isr_do_current(sin_cos, d_a, q_a);
    }

    fn isr_do_stay_within_bounds(&mut self, sin_cos: &SinCos, data: &mut CommandData) {
        let target_position = if !data.bounds_min.is_nan()
            && self.status.unwrapped_position < data.bounds_min
        {
            Some(data.bounds_min)
        } else if !data.bounds_max.is_nan() && self.status.unwrapped_position > data.bounds_max {
            Some(data.bounds_max)
        } else {
            None
        };

        match target_position {
            None => {
                // 範囲内にいる間は位置PIDを寝かせて、
                // フィードフォワードトルクだけを通す
                self.status.pid_position.clear();
                self.status.control_position = f32::NAN;

                let limited_torque_nm =
                    limit(data.feedforward_nm, -data.max_torque_nm, data.max_torque_nm);
                self.control.torque_nm = limited_torque_nm;
                let limited_q_a = self
                    .torque_to_current(limited_torque_nm * self.motor.unwrapped_position_scale);

                self.isr_do_current(sin_cos, 0.0, limited_q_a);
            }
            Some(target) => {
                // 違反している側の境界へ位置制御する
                let options = ApplyOptions {
                    kp_scale: data.kp_scale,
                    kd_scale: data.kd_scale,
                };
                let max_torque_nm = data.max_torque_nm;
                let feedforward_nm = data.feedforward_nm;

                data.position = target;
                data.velocity = 0.0;

                self.isr_do_position_common(
                    sin_cos,
                    data,
                    &options,
                    max_torque_nm,
                    feedforward_nm,
                    0.0,
                );
            }
        }
    }

    /// 電流サンプリング窓を守るデューティクランプ
    fn limit_pwm(&self, value: f32) -> f32 {
        limit(value, MIN_PWM, MAX_PWM)
    }
}
