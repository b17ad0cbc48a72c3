//! 状態推定ステージ
//!
//! 生のサンプル値を工学単位へ変換する：電流 [A]、バス電圧 [V]とその
//! フィルタ値、温度 [°C]、電気角 [rad]、アンラップ位置、速度。
//! d/q電流と軸トルク推定もここで計算する。

use core::f32::consts::TAU;

use libm::roundf;

use crate::config::{MAX_VELOCITY_FILTER, OFFSET_TABLE_SIZE, RATE_HZ};
use crate::foc::transforms::{dq_transform, normalize_angle, sin_cos, SinCos};
use crate::hardware::{DebugDac, MotorDriver, PositionSensor, PwmDriver, ServoAdc};

use super::BldcServo;

/// 47kΩ NTCの分圧回路に対応した温度テーブル [°C]
///
/// ADC生値を32分割したインデックスで引き、隣接エントリ間を線形補間する。
/// テーブル自体はオフラインで生成したもの。
const THERMISTOR_LOOKUP: [f32; 32] = [
    -74.17, // 0
    -11.36, // 128
    1.53,   // 256
    9.97,   // 384
    16.51,  // 512
    21.98,  // 640
    26.79,  // 768
    31.15,  // 896
    35.19,  // 1024
    39.00,  // 1152
    42.65,  // 1280
    46.18,  // 1408
    49.64,  // 1536
    53.05,  // 1664
    56.45,  // 1792
    59.87,  // 1920
    63.33,  // 2048
    66.87,  // 2176
    70.51,  // 2304
    74.29,  // 2432
    78.25,  // 2560
    82.44,  // 2688
    86.92,  // 2816
    91.78,  // 2944
    97.13,  // 3072
    103.13, // 3200
    110.01, // 3328
    118.16, // 3456
    128.23, // 3584
    141.49, // 3712
    161.02, // 3840
    197.66, // 3968
];

/// ADC生値 [0, 4096) をサーミスタ温度 [°C] に変換する
pub(crate) fn thermistor_temp_c(raw: u16) -> f32 {
    const ADC_MAX: i32 = 4096;
    const TABLE_SIZE: i32 = THERMISTOR_LOOKUP.len() as i32;

    let offset = (raw as i32 * TABLE_SIZE / ADC_MAX).clamp(1, TABLE_SIZE - 2);
    let this_value = offset * ADC_MAX / TABLE_SIZE;
    let next_value = (offset + 1) * ADC_MAX / TABLE_SIZE;

    let temp1 = THERMISTOR_LOOKUP[offset as usize];
    let temp2 = THERMISTOR_LOOKUP[offset as usize + 1];
    temp1
        + (temp2 - temp1) * (raw as i32 - this_value) as f32 / (next_value - this_value) as f32
}

/// ロスレスな窓付き移動和による速度フィルタ
///
/// int16の差分をint32の和としてそのまま保持し、平均化は浮動小数点側で
/// 一度だけ行う。丸め誤差の蓄積なしに分解能を最大化できる。
pub(crate) struct WindowedVelocity {
    window: [i16; MAX_VELOCITY_FILTER],
    length: usize,
    index: usize,
    total: i32,
}

impl WindowedVelocity {
    pub fn new(length: usize) -> Self {
        Self {
            window: [0; MAX_VELOCITY_FILTER],
            length: length.clamp(1, MAX_VELOCITY_FILTER),
            index: 0,
            total: 0,
        }
    }

    /// 窓長を変更する（内容はリセット）
    pub fn set_length(&mut self, length: usize) {
        self.length = length.clamp(1, MAX_VELOCITY_FILTER);
        self.window = [0; MAX_VELOCITY_FILTER];
        self.index = 0;
        self.total = 0;
    }

    pub fn add(&mut self, delta: i16) {
        self.total -= self.window[self.index] as i32;
        self.window[self.index] = delta;
        self.total += delta as i32;
        self.index = (self.index + 1) % self.length;
    }

    /// 窓内の差分の総和
    pub fn total(&self) -> i32 {
        self.total
    }

    pub fn size(&self) -> usize {
        self.length
    }
}

/// バス電圧の1次IIRフィルタ
///
/// NaNで初期化され、最初の有効サンプルがそのまま種になる。
fn update_filtered_bus_v(filtered: &mut f32, bus_v: f32, period_s: f32) {
    if filtered.is_nan() {
        *filtered = bus_v;
    } else {
        let alpha = 1.0 / (RATE_HZ * period_s);
        *filtered = alpha * bus_v + (1.0 - alpha) * *filtered;
    }
}

impl<PWM, ADC, ENC, DRV, DAC> BldcServo<PWM, ADC, ENC, DRV, DAC>
where
    PWM: PwmDriver,
    ADC: ServoAdc,
    ENC: PositionSensor,
    DRV: MotorDriver,
    DAC: DebugDac,
{
    /// サンプル値から制御に使う状態量をすべて導出する
    pub(crate) fn isr_estimate(&mut self, delta_position: i16) -> SinCos {
        const U16_TO_THETA: f32 = TAU / 65536.0;

        // 電気角 = 極対数×機械角のmod 2π + セクタ別オフセット
        let offset_index = self.status.position as usize * OFFSET_TABLE_SIZE / 65536;
        self.status.electrical_theta = normalize_angle(
            ((self.position_constant * self.status.position as i32) % 65536) as f32 * U16_TO_THETA
                + self.motor.offset[offset_index],
        );

        let sc = sin_cos(self.status.electrical_theta);
        self.status.sin = sc.s;
        self.status.cos = sc.c;

        // rezero要求が来ていれば、要求位置に最も近い整数回転を選んで
        // アンラップ位置を張り直す。エンコーダは起動後10msまで無効なので
        // それまでは保留する。
        if !self.status.position_to_set.is_nan() && self.startup_count() > 10 {
            let zero_position = (self.status.position as i32
                + self.motor.position_offset * if self.motor.invert { -1 } else { 1 })
                as i16;
            let error = self.status.position_to_set
                - zero_position as f32 * self.motor.unwrapped_position_scale / 65536.0;
            let integral_offsets = roundf(error / self.motor.unwrapped_position_scale);
            self.status.unwrapped_position_raw =
                (zero_position as f32 + integral_offsets * 65536.0) as i32;
            self.status.position_to_set = f32::NAN;
        } else {
            self.status.unwrapped_position_raw =
                self.status.unwrapped_position_raw.wrapping_add(delta_position as i32);
        }

        // 速度：窓内の差分和を浮動小数点で一度だけ平均化
        self.velocity_filter.add(delta_position);
        const VELOCITY_SCALE: f32 = 1.0 / 65536.0;
        self.status.velocity = self.velocity_filter.total() as f32
            * self.motor.unwrapped_position_scale
            * VELOCITY_SCALE
            * RATE_HZ
            / self.velocity_filter.size() as f32;

        self.status.unwrapped_position =
            self.status.unwrapped_position_raw as f32 * self.motor.unwrapped_position_scale
                * (1.0 / 65536.0);

        self.status.fet_temp_c = thermistor_temp_c(self.status.adc_fet_temp_raw);
        self.status.motor_temp_c = thermistor_temp_c(self.status.adc_motor_temp_raw);

        self.status.cur1_a =
            (self.status.adc_cur1_raw as f32 - self.status.adc_cur1_offset as f32) * self.adc_scale;
        self.status.cur2_a =
            (self.status.adc_cur2_raw as f32 - self.status.adc_cur2_offset as f32) * self.adc_scale;
        self.status.cur3_a =
            (self.status.adc_cur3_raw as f32 - self.status.adc_cur3_offset as f32) * self.adc_scale;

        self.status.bus_v = self.status.adc_voltage_sense_raw as f32 * self.config.v_scale_v;
        update_filtered_bus_v(&mut self.status.filt_bus_v, self.status.bus_v, 0.5);
        update_filtered_bus_v(&mut self.status.filt_1ms_bus_v, self.status.bus_v, 0.001);

        // 相2と相3はあえて入れ替えて変換する。PWM出力側にも同じ入れ替えが
        // あり、順序を直すと既設モーターの位置符号が反転してしまう。
        let (d_a, q_a) = dq_transform(&sc, self.status.cur1_a, self.status.cur3_a, self.status.cur2_a);
        self.status.d_a = d_a;
        self.status.q_a = q_a;

        self.status.torque_nm = if self.status.mode.torque_on() {
            self.current_to_torque(self.status.q_a) / self.motor.unwrapped_position_scale
        } else {
            0.0
        };

        // d軸電流をDACへ出してオシロで追えるようにする
        let dac_counts = (1024.0 * self.status.d_a / 30.0) as i32;
        self.dac.write((1024 + dac_counts.clamp(0, 2047)) as u16);

        sc
    }
}
