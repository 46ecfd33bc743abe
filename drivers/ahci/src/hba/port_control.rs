use crate::register::*;

/// Port registers. Each port has a 0x80 byte register block starting at `0x100 + port * 0x80`.
#[derive(Debug)]
#[repr(C)]
pub(crate) struct PortControl {
    /// PxCLB:PxCLBU
    command_list_base: HbaAddr<1024>,
    /// PxFB:PxFBU
    fis_base_address: HbaAddr<256>,
    /// PxIS
    interrupt_status: Register<InterruptStatus, ReadWriteClear<InterruptStatus>>,
    /// PxIE
    interrupt_enable: Register<InterruptEnable>,
    /// PxCMD
    cmd_status: Register<CommStatus>,
    _res0: Register<u32, ReadOnly>,
    /// PxTFD
    task_file_data: Register<TaskFileData, ReadOnly>,
    /// PxSIG
    signature: Register<PortSignature, ReadOnly>,
    /// PxSSTS
    sata_status: Register<SataStatus, ReadOnly>,
    /// PxSCTL
    sata_ctl: Register<SataControl>,
    /// PxSERR
    sata_err: Register<SataErr, ReadWriteClear<SataErr>>,
    /// PxSACT
    _sata_active: Register<u32>,
    /// PxCI
    command_issue: Register<u32>,
    /// PxSNTF
    sata_notification: Register<u32, ReadWriteClear<u32>>,
    /// PxFBS
    _fis_based_switching: Register<u32>,
    /// PxDEVSLP
    _dev_sleep: Register<u32>,
    _res1: [Register<u32, ReadOnly>; 10],
    /// PxVS
    _vendor_specific: [Register<u32>; 4],
}

const _: () = {
    assert!(core::mem::size_of::<PortControl>() == 0x80);
    assert!(core::mem::offset_of!(PortControl, interrupt_status) == 0x10);
    assert!(core::mem::offset_of!(PortControl, task_file_data) == 0x20);
    assert!(core::mem::offset_of!(PortControl, sata_err) == 0x30);
    assert!(core::mem::offset_of!(PortControl, command_issue) == 0x38);
    assert!(core::mem::offset_of!(PortControl, _dev_sleep) == 0x44);
    assert!(core::mem::offset_of!(PortControl, _vendor_specific) == 0x70);
};

impl PortControl {
    /// Returns the state of the device connected to the port. The caller should query
    /// [super::general_control::GeneralControl] for implemented ports.
    pub fn get_port_state(&self) -> crate::LinkState {
        use crate::LinkState;
        let status = self.sata_status.read();
        if status.dev_detect() == DeviceDetection::InComm {
            if status.power_management() == PowerState::Active {
                LinkState::Hot
            } else {
                LinkState::Warm
            }
        } else if self
            .cmd_status
            .read()
            .contains(CommStatus::COLD_PRESENCE_STATE)
        {
            LinkState::Cold
        } else if status.dev_detect() == DeviceDetection::NoComm {
            LinkState::Present
        } else {
            LinkState::None
        }
    }

    /// Sets PxCLB. `addr` must be aligned to 1024 bytes.
    pub(crate) fn set_command_list(&self, addr: u64) {
        self.command_list_base.set(addr);
    }

    pub(crate) fn command_list(&self) -> u64 {
        self.command_list_base.read()
    }

    /// Sets PxFB. `addr` must be aligned to 256 bytes.
    pub(crate) fn set_fis_base(&self, addr: u64) {
        self.fis_base_address.set(addr)
    }

    pub(crate) fn fis_base(&self) -> u64 {
        self.fis_base_address.read()
    }

    pub(crate) fn interrupt_status(&self) -> InterruptStatus {
        InterruptStatus::from_bits_truncate(self.interrupt_status.read().bits())
    }

    /// Acknowledges the interrupts in `status`
    pub(crate) fn ack_interrupts(&self, status: InterruptStatus) {
        self.interrupt_status.clear(status)
    }

    pub(crate) fn set_interrupt_enable(&self, enable: InterruptEnable) {
        self.interrupt_enable.write(enable)
    }

    pub(crate) fn cmd(&self) -> CommStatus {
        self.cmd_status.read()
    }

    pub(crate) fn update_cmd(&self, f: impl FnOnce(&mut CommStatus)) {
        self.cmd_status.update(f)
    }

    pub(crate) fn task_file(&self) -> TaskFileData {
        self.task_file_data.read()
    }

    pub(crate) fn signature(&self) -> PortSignature {
        self.signature.read()
    }

    pub(crate) fn sata_status(&self) -> SataStatus {
        self.sata_status.read()
    }

    pub(crate) fn set_dev_detect_init(&self, action: DeviceDetectionInit) {
        self.sata_ctl.update(|c| c.set_dev_detect_init(action))
    }

    /// Returns PxSERR, reserved bits are ignored.
    pub(crate) fn sata_err(&self) -> SataErr {
        SataErr::from_bits_truncate(self.sata_err.read().bits())
    }

    /// Clears all set bits in PxSERR
    pub(crate) fn clear_sata_err(&self) {
        self.sata_err.clear(self.sata_err())
    }

    /// Returns PxCI
    pub(crate) fn get_ci(&self) -> u32 {
        self.command_issue.read()
    }

    /// Executes the command in slot `cmd`.
    /// Only bit `cmd` is written, the other bits in PxCI are not modified by writing `0`.
    ///
    /// # Safety
    ///
    /// The caller must ensure that the FIS in the given command slot is valid and that the PRDT has
    /// been configured correctly.
    pub(crate) unsafe fn exec_cmd(&self, cmd: u8) {
        assert!(cmd < 32);
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        self.command_issue.write(1 << cmd);
    }

    /// Acknowledges all SDB notifications.
    pub(crate) fn clear_notifications(&self) {
        self.sata_notification.clear(!0u32)
    }

}

bitflags::bitflags! {
    /// PxIS
    ///
    /// Represents the port interrupt status register. All but explicitly mentioned flags in this
    /// register are cleared by writing a `1`
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    #[repr(transparent)]
    pub(crate) struct InterruptStatus: u32 {
        /// CPDS (R1C)
        ///
        /// A device change was detected by cold presence logic. Only valid if the port supports
        /// cold presence logic.
        const COLD_PORT_DETECT = 1 << 31;
        /// TFES (R1C)
        ///
        /// Set when a device returns an error in a FIS
        const TASK_FILE_ERROR = 1 << 30;
        /// HBFS (R1C)
        ///
        /// Indicates that the HBA encountered a fatal error, such as a bad software pointer.
        /// Will be indicated with a PCI error.
        const HOST_BUS_FATAL = 1 << 29;
        /// HBDS (R1C)
        ///
        /// Indicates that the HBA encountered a data error when accessing system memory.
        const HOST_BUS_DATA_ERR = 1 << 28;
        /// IFS (R1C)
        ///
        /// Indicates the HBA encountered an error that caused a transfer to stop.
        const INTERFACE_FATAL = 1 << 27;
        /// INFS (R1C)
        ///
        /// Indicates the HBA encountered an error on the sata interface but was able to continue
        /// operation.
        const INTERFACE_NON_FATAL = 1 << 26;
        /// OFS (R1C)
        ///
        /// Indicates HBA received more bytes than was expected
        const OVERFLOW = 1 << 24;
        /// IPMS (R1C)
        ///
        /// Indicates that the HBA received an unexpected FIS. This may be set by the enumeration
        /// of a port multiplier. This should be disabled during port enumeration.
        const BAD_PORT_MULTIPLIER_STATUS = 1 << 23;
        /// PRCS (RO)
        ///
        /// This bit is read only and reflects the state of [SataErr::PHY_RDY_CHANGE]. This bit is
        /// cleared by clearing [SataErr::PHY_RDY_CHANGE].
        const PHY_RDY_CHANGE = 1 << 22;
        /// DMPS (R1C)
        ///
        /// Indicates the mechanical presence switch associated with this port has been opened or
        /// closed.
        const DEVICE_MECHANICAL_PRESENCE = 1 << 7;
        /// PCS (RO)
        ///
        /// Indicates that the port connection has changed.
        /// This bit reflects the state of [SataErr::EXCHANGED] which mist be cleared to clear this bit.
        const PORT_CONNECT_CHANGE = 1 << 6;
        /// DPS (R1C)
        ///
        /// A PRD with the i bit set has been processed.
        const DESCRIPTOR_PROCESSED = 1 << 5;
        /// UFS (RO)
        ///
        /// This bit is read only. It is set when an unknown FIS is received.
        /// This bit is cleared by clearing [SataErr::UNKNOWN_FIS_TYPE].
        const UNKNOWN_FIS_INT = 1 << 4;
        /// SDBS (R1C)
        ///
        /// A device has sent a Set Bits FIS with a the interrupt flag enabled.
        const SET_DEV_BITS = 1 << 3;
        /// DSS (R1C)
        ///
        /// A DMA setup fis has been received with the Interrupt flag set.
        const DMA_SETUP_FIS = 1 << 2;
        /// PSS (R1C)
        ///
        /// A PIO setup FIS Has been sent with the Interrupt flag set.
        const PIO_SETUP_FIS = 1 << 1;
        /// DHRS (R1C)
        ///
        /// A D2H Register FIS has been received with the Interrupt flag set
        const DEV_TO_HOST_FIS = 1;
    }

    /// This is used to enable interrupts. When set allows the corresponding bit in [InterruptStatus]
    /// to generate an interrupt.
    #[derive(Debug, Copy, Clone)]
    #[repr(transparent)]
    pub(crate) struct InterruptEnable: u32 {
        const COLD_PORT_DETECT = 1 << 31;
        const TASK_FILE_ERROR = 1 << 30;
        const HOST_BUS_FATAL = 1 << 29;
        const HOST_BUS_DATA_ERR = 1 << 28;
        const INTERFACE_FATAL = 1 << 27;
        const INTERFACE_NON_FATAL = 1 << 26;
        const OVERFLOW = 1 << 24;
        const BAD_PORT_MULTIPLIER_STATUS = 1 << 23;
        const PHY_RDY_CHANGE = 1 << 22;
        const DEVICE_MECHANICAL_PRESENCE = 1 << 7;
        const PORT_CONNECT_CHANGE = 1 << 6;
        const DESCRIPTOR_PROCESSED = 1 << 5;
        const UNKNOWN_FIS_INT = 1 << 4;
        const SET_DEV_BITS = 1 << 3;
        const DMA_SETUP_FIS = 1 << 2;
        const PIO_SETUP_FIS = 1 << 1;
        const DEV_TO_HOST_FIS = 1;
    }

    /// PxCMD
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    #[repr(transparent)]
    pub(crate) struct CommStatus: u32 {
        /// ASP (CD)
        ///
        /// When set and [Self::AGGRESSIVE_LINK_POWER_MAN_ENABLE] is set the device will be be set
        /// to slumber when its idle conditions are met. When cleared the device will be set to
        /// the partial state
        const AGGRESSIVE_LOW_POWER = 1 << 27;
        /// ALPE (CD)
        ///
        /// When set the device will use aggressive power management features.
        const AGGRESSIVE_LINK_POWER_MAN_ENABLE = 1 << 26;
        /// DLAE (RW)
        ///
        /// When set the device will drive the LED pin regardless of [Self::DEVICE_IS_ATAPI].
        const DRIVE_LED_ON_ATAPI = 1 << 25;
        /// ATAPI (RW)
        ///
        /// When set indicates the connected device ATAPI. This is used by the hba to control whether
        /// the drive LED is used by this port
        const DEVICE_IS_ATAPI = 1 << 24;
        /// APSTE (RW)
        ///
        /// When set the HBA may perform automatic partial to slumber transactions. Software shall
        /// not set this bit if [super::general_control::HbaCapabilitiesExt::AUTOMATIC_PARTIAL_TO_SLEEP]
        /// is not present.
        const AUTO_PARTIAL_TO_SLUMBER = 1 << 23;
        /// FBSCP (RO)
        ///
        /// Indicates this port supports FIS-based switching
        const FIS_BASED_SWITCHING_CAPABLE = 1 << 22;
        /// ESP (RO)
        ///
        /// Indicates that this port is connected to an external eSATA port. When set this port may
        /// encounter hot plug events regardless of [Self::HOT_PLUG_CAPABLE].
        const ESATA_PORT = 1 << 21;
        /// CPD (RO)
        ///
        /// Indicates that th port supports cold presence detection.
        const COLD_PRESENCE_DETECTION = 1 << 20;
        /// MPSP (RO)
        ///
        /// Indicates that a mechanical presence switch is connected to this port.
        const MECHAINICAL_PRESENCE_SWITCH_ATTACHED = 1 << 19;
        /// HPCP (RO)
        ///
        /// Indicates that this port may experience hot plug events.
        const HOT_PLUG_CAPABLE = 1 << 18;
        /// PMA (CD)
        ///
        /// Indicates that a port multiplier is attached. Software must detect a port multiplier and
        /// set this bit. Software should not set this bit when [Self::START] is present
        const PORT_MULTIPLIER_ATTACHED = 1 << 17;
        /// CPS (RO)
        ///
        /// When set indicates that a device is detected by cold presence detection.
        const COLD_PRESENCE_STATE = 1 << 16;
        /// CR (RO)
        ///
        /// When set indicates the command list DMA engine for this port is running.
        const COMMAND_LIST_RUNNING = 1 << 15;
        /// FR (RO)
        ///
        /// When set the FIS receive DMA engine is running fo this port.
        const FIS_RECIEVE_RUNNING = 1 << 14;
        /// MPSS (RO)
        ///
        /// Reports the state of the mechanical presence switch attached to this port.
        const MECHANICAL_PRESENCE_SWITCH_STATE = 1 << 13;
        /// FRE (RW)
        ///
        /// When set the HBA will post received FISes into the receive are pointed to by PxFB.
        /// When cleared FISes are not accepted by the HBA except for the first D2H register FIS
        /// after initialization.
        ///
        /// This must not be set this until until PxFB has been set
        const FIS_RECIEVE_ENABLE = 1 << 4;
        /// CLO (RW1)
        ///
        /// Setting this bit will clear [TaskFileData] BSY and DRQ bits
        const COMMAND_LIST_OVERRIDE = 1 << 3;
        /// POD (CD)
        ///
        /// When [Self::COLD_PRESENCE_DETECTION] is present this field is (RW) otherwise it is (RO).
        /// When this bit is set by software the HBA enables power to the device.
        const POWER_ON_DEVICE = 1 << 2;
        /// SUD (CD)
        ///
        /// When [super::general_control::HbaCapabilities::STAGGERED_SPIN_UP] is present this bit is (RW).
        /// Otherwise it is (RO) and set to 1. When this bit is set form 0 to 1 the HBA will signal
        /// a COMRESET to the device.
        const SPIN_UP_DEVICE = 1 << 1;
        /// ST (RW)
        ///
        /// While set the HBA may process the command list. When this bit is set the command list
        /// will be processed from entry 0. When this bit is cleared the PxCI register is cleared.
        /// This shall only be set when [Self::FIS_RECIEVE_ENABLE] is set.
        const START = 1;

        const _ = !0;
    }

    /// DIAG (RWC)
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    #[repr(transparent)]
    pub(crate) struct SataErr: u32 {
        /// DIAG.X
        ///
        /// Indicates a change in device presence.
        const EXCHANGED =  1 << 26;
        /// DIAG.F
        ///
        /// Indicates that a FIS was received with a good CRC but an unknown field.
        const UNKNOWN_FIS_TYPE =  1 << 25;
        /// DIAG.T
        ///
        /// Indicates that a state transition within the transport layer has encountered an error.
        const TRANSPORT_STATE_TRANSITION_ERR =  1 << 24;
        /// DIAG.S
        ///
        /// Indicates that the link layer state machine has encountered an error.
        const LINK_SEQUENCE_ERR =  1 << 23;
        /// DIAG.H
        ///
        /// Indicates that one or more R_ERR (received error) responses was returned from a frame
        /// transition.
        const HANDSHAKE_ERR =  1 << 22;
        /// DIAG.C
        ///
        /// Indicates that a CRC error was encountered by the link layer.
        const CRC_ERR =  1 << 21;
        /// DIAG.D
        ///
        /// This is not used by AHCI.
        const DISPARITY_ERR =  1 << 20;
        /// DIAG.B
        ///
        /// Indicates that a 10b/8b decoding error was encountered.
        const DECODE_ERROR =  1 << 19;
        /// DIAG.W
        ///
        /// Indicates that a Comm Wake signal was encountered.
        const COMM_WAKE =  1 << 18;
        /// DIAG.I
        ///
        /// Indicates that the phy detected an internal error.
        const PHY_INTERNAL_ERR =  1 << 17;
        /// DIAG.N
        ///
        /// Indicates that the PhyRdy Signal changed state.
        const PHY_RDY_CHANGE =  1 << 16;

        /// ERR.E
        ///
        /// The HBA encountered an error that may include a master or target abort from the PCI
        /// interface or another internal condition.
        const INTERNAL_ERR = 1 << 11;
        /// ERR.P
        ///
        /// A SATA protocol violation was detected
        const PROTOCOL_ERR = 1 << 10;
        /// ERR.C
        ///
        /// An unrecoverable communication occurred and is expected to be persistent. This may
        /// indicate a hardware error.
        const PERSISTANT_COMM_DATA_ERR = 1 << 9;
        /// ERR.T
        ///
        /// A data integrety error was encountered that was not recovered by the interface
        const TRANSIENT_DATA_ERR = 1 << 8;
        /// ERR.M
        ///
        /// Communication between the the device and host was temporarily lost and re-established.
        const RECOVERED_COMM_ERR = 1 << 1;
        /// ERR.I
        ///
        /// A data integrity error was encountered and recovered thorough a retry
        const RECOVERED_DATA_ERR = 1;
    }
}

// SAFETY: Read only bits ignore writes
unsafe impl Acknowledge<InterruptStatus> for InterruptStatus {
    fn ack(self) -> InterruptStatus {
        Self::from_bits_truncate(self.bits())
    }
}

// SAFETY: Only defined bits are written
unsafe impl Acknowledge<SataErr> for SataErr {
    fn ack(self) -> SataErr {
        Self::from_bits_truncate(self.bits())
    }
}

unsafe impl ClearReserved for InterruptEnable {
    fn clear_reserved(&mut self) {
        *self = Self::from_bits_truncate(self.bits());
    }
}

impl InterruptEnable {
    /// Interrupts handled by the driver.
    pub(crate) fn driver_default() -> Self {
        Self::DEV_TO_HOST_FIS
            | Self::PIO_SETUP_FIS
            | Self::DMA_SETUP_FIS
            | Self::SET_DEV_BITS
            | Self::DESCRIPTOR_PROCESSED
            | Self::PORT_CONNECT_CHANGE
            | Self::PHY_RDY_CHANGE
            | Self::DEVICE_MECHANICAL_PRESENCE
            | Self::OVERFLOW
            | Self::INTERFACE_NON_FATAL
            | Self::INTERFACE_FATAL
            | Self::HOST_BUS_DATA_ERR
            | Self::HOST_BUS_FATAL
            | Self::TASK_FILE_ERROR
            | Self::COLD_PORT_DETECT
    }
}

impl InterruptStatus {
    /// Interrupts indicating the attached device has changed.
    pub(crate) fn hot_plug() -> Self {
        Self::PHY_RDY_CHANGE
            | Self::PORT_CONNECT_CHANGE
            | Self::COLD_PORT_DETECT
            | Self::DEVICE_MECHANICAL_PRESENCE
    }

    /// Errors which halt the command engine and fail all in flight commands.
    pub(crate) fn transport_errors() -> Self {
        Self::INTERFACE_FATAL | Self::HOST_BUS_DATA_ERR | Self::OVERFLOW
    }
}

#[repr(u8)]
#[derive(Eq, PartialEq, Debug, Default, Copy, Clone)]
pub enum PowerState {
    /// No device is present or communication is not established
    #[default]
    Idle = 0,
    /// The interface is in the active state.
    Active,
    /// The interface is in the partial power state.
    Partial,
    /// The interface is in the slumber power state.
    Slumber = 6,
    /// The interface is in the DevSleep power state.
    DevSleep = 8,
    /// A value not defined by AHCI 1.3
    Reserved = 0xff,
}

impl From<u8> for PowerState {
    /// Retrieves a variant from the raw value using bits 0..4
    fn from(value: u8) -> Self {
        match value & 0xf {
            0 => Self::Idle,
            1 => Self::Active,
            2 => Self::Partial,
            6 => Self::Slumber,
            8 => Self::DevSleep,
            _ => Self::Reserved,
        }
    }
}

// SAFETY: this does not contain reserved bits
unsafe impl ClearReserved for CommStatus {
    fn clear_reserved(&mut self) {
        // CLO is RW1, writing it back would perform an override
        self.remove(Self::COMMAND_LIST_OVERRIDE);
    }
}

impl CommStatus {
    /// CCS (RO)
    ///
    /// This field is valid when [Self::START] is set and is set to the the slot of the current
    /// command being issued. When [Self::START] is cleared this field is set to `0`.
    pub fn get_current_command(&self) -> u8 {
        ((self.bits() >> 8) & 0x1f) as u8
    }

    /// ICC
    ///
    /// Requests the interface move to `state`
    pub fn set_power_state(&mut self, state: PowerState) {
        let mut t = self.bits();
        t &= !(0xf << 28);
        t |= (state as u32 & 0xf) << 28;
        *self = Self::from_bits_retain(t);
    }
}

/// PxTFD (RO)
///
/// This register copied specific fields of the task file when FISes are received.
///
/// The FISes that contain this information are
/// - D2H Register FIS
/// - PIO setup FIS
/// - Set device bits FIS
#[derive(Debug, Copy, Clone)]
#[repr(C)]
pub(crate) struct TaskFileData {
    status: u8,
    err: u8,
    _reserved: u16,
}

impl TaskFileData {
    /// Returns the latest copy of the task file error register.
    pub(crate) fn get_err(&self) -> u8 {
        self.err
    }

    /// Returns the status
    pub(crate) fn get_status(&self) -> u8 {
        self.status
    }

    /// Returns whether BSY or DRQ are set.
    pub(crate) fn is_busy(&self) -> bool {
        self.status & (ata::status::BUSY | ata::status::DATA_REQUEST) != 0
    }

    pub(crate) fn is_err(&self) -> bool {
        self.status & ata::status::ERROR != 0
    }
}

/// PxSIG (RO)
///
/// This register is set when the first D2H FIS is received from the device.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct PortSignature(u32);

impl PortSignature {
    pub const ATA: Self = Self(0x0000_0101);
    pub const ATAPI: Self = Self(0xeb14_0101);
    pub const SEMB: Self = Self(0xc33c_0101);
    pub const PORT_MULTIPLIER: Self = Self(0x9669_0101);

    pub fn raw(&self) -> u32 {
        self.0
    }

    pub fn device_type(&self) -> crate::DeviceType {
        use crate::DeviceType;
        match *self {
            Self::ATA => DeviceType::Sata,
            Self::ATAPI => DeviceType::Satapi,
            Self::SEMB => DeviceType::Semb,
            Self::PORT_MULTIPLIER => DeviceType::PortMultiplier,
            _ => DeviceType::Unknown,
        }
    }
}

/// PxSSTS (RO)
#[repr(transparent)]
#[derive(Debug, Copy, Clone)]
pub(crate) struct SataStatus {
    inner: u32,
}

#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum DeviceDetection {
    /// No device is connected to the port.
    NoDevice = 0,
    /// A device is connected to the but Physical communication is not established
    NoComm,
    /// A device is connected and communication has been established
    InComm = 3,
    /// The port is disabled.
    Offline,
    Reserved,
}

impl SataStatus {
    /// IPM
    ///
    /// This fn returns the current power state of the device.
    /// The return value of this fn reflects the current state of the device not an active transition
    pub fn power_management(&self) -> PowerState {
        ((self.inner >> 8) as u8 & 0xf).into()
    }

    /// SPD
    /// Returns the negotiated interface generation if the device is enabled
    pub fn interface_speed(&self) -> Option<u8> {
        match (self.inner >> 4) & 0xf {
            0 => None,
            n => Some(n as u8),
        }
    }

    /// DET
    pub fn dev_detect(&self) -> DeviceDetection {
        match self.inner & 0xf {
            0 => DeviceDetection::NoDevice,
            1 => DeviceDetection::NoComm,
            3 => DeviceDetection::InComm,
            4 => DeviceDetection::Offline,
            _ => DeviceDetection::Reserved,
        }
    }
}

/// PxSCTL
#[repr(transparent)]
#[derive(Debug, Copy, Clone)]
pub(crate) struct SataControl {
    inner: u32,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum DeviceDetectionInit {
    /// Performs no action
    NoAction = 0,
    /// Performs an initialization of the interface. This is essentially a reset of the interface.
    /// When set it should be cleared after a minimum of 1ms
    ResetInterface,
    /// Disable the interface and put Phy in offline mode
    DisableInterface = 4,
}

impl SataControl {
    /// DET (RW)
    ///
    /// Controls the device detection and initialization
    pub fn set_dev_detect_init(&mut self, action: DeviceDetectionInit) {
        self.inner &= !0xf;
        self.inner |= action as u32;
    }
}

// SAFETY: reserved bits are 20..31
unsafe impl ClearReserved for SataControl {
    fn clear_reserved(&mut self) {
        self.inner &= 0xf_ffff
    }
}
