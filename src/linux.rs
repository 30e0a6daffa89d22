use std::io::ErrorKind as IoErrorKind;
use std::path::Path;

use linux_embedded_hal::serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};
use linux_embedded_hal::{Delay, Serial};

use crate::sim::{SimDevice, SoftCrc};
use crate::{Bootloader, Options};

impl Bootloader<Serial, Delay, SoftCrc, SimDevice, IoErrorKind> {
    /// Serve the bootloader protocol on a linux serial port, backed by the
    /// simulated device. A jump command ends the process, standing in for
    /// the one-way handoff.
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        options: Options,
    ) -> Result<Self, SerialError> {
        // Open port
        let mut port = Serial::open(port.as_ref())?;

        // Apply settings
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(baud))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityNone);

        port.0.write_settings(&settings)?;

        let device = SimDevice::new();
        device.exit_on_jump();

        // Return instance
        Ok(Self::new(port, Delay {}, SoftCrc::new(), device, options))
    }
}
