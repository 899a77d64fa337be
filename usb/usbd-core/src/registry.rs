//! The device object model: configurations, interfaces, alternate settings, interface groups and
//! the logical endpoints they declare.
//!
//! Everything lives in fixed-size [Pool]s and is addressed by small numbers. A configuration
//! number carries the speed in its top bit ([CONFIG_NBR_SPD_BIT]); interface, alternate setting
//! and group numbers are positions inside their parent and double as the values placed in
//! descriptors.

use std::collections::BTreeMap;
use std::sync::Arc;

use driver_udc::{
    endpoint_addr_to_phy, endpoint_is_in, EndpointCapability, EndpointTy, Speed,
    ENDP_ATTR_SYNC_MASK, ENDP_ATTR_USAGE_MASK,
};
use smallvec::SmallVec;

use crate::alloc;
use crate::bitmap::EndpointMap;
use crate::class::{ClassArg, ClassDriver, InterfaceCtx};
use crate::config::PoolConfig;
use crate::pool::Pool;
use crate::usb::{
    CLASS_AUDIO, CONFIG_ATTR_REMOTE_WAKEUP, CONFIG_ATTR_SELF_POWERED, ISOC_SYNC_ADAPTIVE,
    ISOC_SYNC_ASYNC, ISOC_SYNC_NONE, ISOC_USAGE_DATA, ISOC_USAGE_FEEDBACK,
};
use crate::{Error, Result};

/// Set in a configuration number when it belongs to the high-speed list.
pub const CONFIG_NBR_SPD_BIT: u8 = 0x80;

/// Largest bMaxPower, in mA.
const MAX_POWER_MA: u16 = 500;

pub(crate) struct Configuration {
    pub attributes: u8,
    pub max_power: u16,
    pub name: Option<String>,
    pub interfaces: SmallVec<[usize; 4]>,
    pub groups: SmallVec<[usize; 2]>,
    pub ep_map: EndpointMap,
    pub other_speed: Option<u8>,
}

pub(crate) struct Interface {
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub driver: Arc<dyn ClassDriver>,
    pub arg: Option<ClassArg>,
    pub alts: SmallVec<[usize; 4]>,
    pub alt_cur: u8,
    pub group: Option<u8>,
    pub ep_map: EndpointMap,
}

pub(crate) struct AltInterface {
    pub arg: Option<ClassArg>,
    pub name: Option<String>,
    pub ep_map: EndpointMap,
    /// Endpoint infos keyed by physical endpoint number, which is also descriptor order.
    pub endpoints: BTreeMap<u8, usize>,
}

pub(crate) struct InterfaceGroup {
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub first: u8,
    pub count: u8,
    pub name: Option<String>,
}

/// A logical endpoint as declared by a class driver.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EndpointInfo {
    pub address: u8,
    pub attributes: u8,
    /// wMaxPacketSize: size in bits 10:0, extra transactions per microframe in bits 12:11.
    pub max_packet_size: u16,
    /// bInterval, already encoded for the speed.
    pub interval: u8,
    pub sync_address: u8,
    pub sync_refresh: u8,
}

impl EndpointInfo {
    pub fn ty(&self) -> EndpointTy {
        EndpointTy::from_attributes(self.attributes)
    }

    pub fn packet_size(&self) -> u16 {
        self.max_packet_size & 0x7FF
    }

    pub fn transactions(&self) -> u8 {
        (((self.max_packet_size >> 11) & 0x3) + 1) as u8
    }
}

/// Strings referenced by descriptors. Index 0 is reserved for the LANGID table, so entries are
/// numbered from 1.
pub(crate) struct StringTable {
    strings: Vec<String>,
    capacity: usize,
}

impl StringTable {
    fn new(capacity: usize) -> Self {
        Self {
            strings: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn index(&self, text: &str) -> u8 {
        self.strings
            .iter()
            .position(|s| s == text)
            .map(|ix| ix as u8 + 1)
            .unwrap_or(0)
    }

    pub fn get(&self, index: u8) -> Option<&str> {
        let ix = usize::from(index).checked_sub(1)?;
        self.strings.get(ix).map(String::as_str)
    }

    /// Whether `names` can all be added without running out of room.
    fn has_room_for(&self, names: &[Option<&str>]) -> bool {
        let mut fresh: SmallVec<[&str; 2]> = SmallVec::new();
        for name in names.iter().flatten() {
            if self.index(name) == 0 && !fresh.contains(name) {
                fresh.push(name);
            }
        }
        self.strings.len() + fresh.len() <= self.capacity
    }

    pub fn add(&mut self, text: &str) -> Result<u8> {
        if text.is_empty() {
            return Err(Error::InvalidParameter("string"));
        }
        match self.index(text) {
            0 if self.strings.len() >= self.capacity => Err(Error::AllocationExhausted),
            0 => {
                self.strings.push(text.to_string());
                Ok(self.strings.len() as u8)
            }
            index => Ok(index),
        }
    }
}

pub(crate) fn config_speed(cfg_nbr: u8) -> Speed {
    if cfg_nbr & CONFIG_NBR_SPD_BIT != 0 {
        Speed::High
    } else {
        Speed::Full
    }
}

#[derive(Clone)]
pub(crate) struct AltSnapshot {
    pub nbr: u8,
    pub arg: Option<ClassArg>,
    pub name_idx: u8,
    pub endpoints: Vec<EndpointInfo>,
}

#[derive(Clone)]
pub(crate) struct InterfaceSnapshot {
    pub nbr: u8,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub driver: Arc<dyn ClassDriver>,
    pub arg: Option<ClassArg>,
    pub alt_cur: u8,
    pub group: Option<u8>,
    pub alts: Vec<AltSnapshot>,
}

impl InterfaceSnapshot {
    pub fn current_alt(&self) -> Option<&AltSnapshot> {
        self.alts.get(usize::from(self.alt_cur))
    }

    /// Callback context for alternate setting `alt_nbr` of this interface.
    pub fn ctx(&self, cfg_nbr: u8, alt_nbr: u8) -> InterfaceCtx {
        InterfaceCtx {
            config: cfg_nbr,
            interface: self.nbr,
            alt: alt_nbr,
            if_arg: self.arg.clone(),
            alt_arg: self.alts.get(usize::from(alt_nbr)).and_then(|alt| alt.arg.clone()),
        }
    }

    /// Audio 1.0 interfaces carry the two extra endpoint descriptor fields.
    pub fn is_audio_v1(&self) -> bool {
        self.class == CLASS_AUDIO && self.protocol == 0
    }
}

#[derive(Clone)]
pub(crate) struct GroupSnapshot {
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub first: u8,
    pub count: u8,
    pub name_idx: u8,
}

/// A copy of one configuration, taken so descriptors can be built and class drivers called
/// without holding the registry lock.
#[derive(Clone)]
pub(crate) struct ConfigSnapshot {
    pub nbr: u8,
    pub attributes: u8,
    pub max_power: u16,
    pub name_idx: u8,
    pub interfaces: Vec<InterfaceSnapshot>,
    pub groups: Vec<GroupSnapshot>,
}

pub(crate) struct Registry {
    configs_fs: Pool<Configuration>,
    configs_hs: Pool<Configuration>,
    interfaces: Pool<Interface>,
    alts: Pool<AltInterface>,
    groups: Pool<InterfaceGroup>,
    infos: Pool<EndpointInfo>,
    pub strings: StringTable,
    max_phy: u8,
}

impl Registry {
    pub fn new(pools: &PoolConfig) -> Self {
        Self {
            configs_fs: Pool::with_capacity(pools.configurations),
            configs_hs: Pool::with_capacity(pools.configurations),
            interfaces: Pool::with_capacity(pools.interfaces),
            alts: Pool::with_capacity(pools.alt_interfaces),
            groups: Pool::with_capacity(pools.interface_groups),
            infos: Pool::with_capacity(pools.endpoint_infos),
            strings: StringTable::new(pools.strings),
            max_phy: 2,
        }
    }

    fn configs(&self, speed: Speed) -> &Pool<Configuration> {
        match speed {
            Speed::High => &self.configs_hs,
            _ => &self.configs_fs,
        }
    }

    /// Number of configurations a host sees at `speed`.
    pub fn config_count(&self, speed: Speed) -> usize {
        self.configs(speed).len()
    }

    /// Whether any configuration at `speed` uses Interface Association Descriptors.
    pub fn has_groups(&self, speed: Speed) -> bool {
        let configs = self.configs(speed);
        (0..configs.len()).any(|ix| !configs[ix].groups.is_empty())
    }

    /// Highest physical endpoint number in use, plus one.
    pub fn max_phy(&self) -> u8 {
        self.max_phy
    }

    pub fn config(&self, cfg_nbr: u8) -> Result<&Configuration> {
        let ix = usize::from(cfg_nbr & !CONFIG_NBR_SPD_BIT);
        self.configs(config_speed(cfg_nbr))
            .get(ix)
            .ok_or(Error::InvalidHandle)
    }

    fn config_mut(&mut self, cfg_nbr: u8) -> Result<&mut Configuration> {
        let ix = usize::from(cfg_nbr & !CONFIG_NBR_SPD_BIT);
        let configs = match config_speed(cfg_nbr) {
            Speed::High => &mut self.configs_hs,
            _ => &mut self.configs_fs,
        };
        configs.get_mut(ix).ok_or(Error::InvalidHandle)
    }

    fn interface_handle(&self, cfg_nbr: u8, if_nbr: u8) -> Result<usize> {
        self.config(cfg_nbr)?
            .interfaces
            .get(usize::from(if_nbr))
            .copied()
            .ok_or(Error::InvalidHandle)
    }

    pub fn interface(&self, cfg_nbr: u8, if_nbr: u8) -> Result<&Interface> {
        let handle = self.interface_handle(cfg_nbr, if_nbr)?;
        Ok(&self.interfaces[handle])
    }

    fn alt_handle(&self, cfg_nbr: u8, if_nbr: u8, alt_nbr: u8) -> Result<usize> {
        self.interface(cfg_nbr, if_nbr)?
            .alts
            .get(usize::from(alt_nbr))
            .copied()
            .ok_or(Error::InvalidHandle)
    }

    pub fn alt(&self, cfg_nbr: u8, if_nbr: u8, alt_nbr: u8) -> Result<&AltInterface> {
        let handle = self.alt_handle(cfg_nbr, if_nbr, alt_nbr)?;
        Ok(&self.alts[handle])
    }

    pub fn set_alt_cur(&mut self, cfg_nbr: u8, if_nbr: u8, alt_nbr: u8) -> Result<()> {
        let handle = self.interface_handle(cfg_nbr, if_nbr)?;
        self.interfaces[handle].alt_cur = alt_nbr;
        Ok(())
    }

    pub fn reset_alt_cur(&mut self, cfg_nbr: u8) -> Result<()> {
        let handles = self.config(cfg_nbr)?.interfaces.clone();
        for handle in handles {
            self.interfaces[handle].alt_cur = 0;
        }
        Ok(())
    }

    pub fn add_configuration(
        &mut self,
        name: Option<&str>,
        attributes: u8,
        max_power: u16,
        speed: Speed,
        drv_speed: Speed,
    ) -> Result<u8> {
        if attributes & !(CONFIG_ATTR_SELF_POWERED | CONFIG_ATTR_REMOTE_WAKEUP) != 0 {
            return Err(Error::InvalidParameter("attributes"));
        }
        if max_power > MAX_POWER_MA {
            return Err(Error::InvalidParameter("max_power"));
        }
        let spd_bit = match speed {
            Speed::High if drv_speed == Speed::High => CONFIG_NBR_SPD_BIT,
            Speed::High => return Err(Error::InvalidParameter("speed")),
            Speed::Full => 0,
            Speed::Low => return Err(Error::InvalidParameter("speed")),
        };
        if self.configs(speed).is_full() {
            return Err(Error::AllocationExhausted);
        }
        if !self.strings.has_room_for(&[name]) {
            return Err(Error::AllocationExhausted);
        }
        if let Some(name) = name {
            self.strings.add(name)?;
        }

        let config = Configuration {
            attributes,
            max_power,
            name: name.map(str::to_string),
            interfaces: SmallVec::new(),
            groups: SmallVec::new(),
            ep_map: EndpointMap::CTRL_ALLOC,
            other_speed: None,
        };
        let ix = match speed {
            Speed::High => self.configs_hs.alloc(config)?,
            _ => self.configs_fs.alloc(config)?,
        };
        Ok(ix as u8 | spd_bit)
    }

    pub fn associate_other_speed(&mut self, cfg_nbr: u8, other_nbr: u8) -> Result<()> {
        if config_speed(cfg_nbr) == config_speed(other_nbr) {
            return Err(Error::InvalidParameter("configurations share a speed"));
        }
        if self.config(cfg_nbr)?.other_speed.is_some() || self.config(other_nbr)?.other_speed.is_some() {
            return Err(Error::AlreadyExists);
        }
        self.config_mut(cfg_nbr)?.other_speed = Some(other_nbr);
        self.config_mut(other_nbr)?.other_speed = Some(cfg_nbr);
        Ok(())
    }

    /// Adds an interface together with its default alternate setting.
    #[allow(clippy::too_many_arguments)]
    pub fn add_interface(
        &mut self,
        cfg_nbr: u8,
        driver: Arc<dyn ClassDriver>,
        if_arg: Option<ClassArg>,
        alt_arg: Option<ClassArg>,
        class: u8,
        sub_class: u8,
        protocol: u8,
        name: Option<&str>,
    ) -> Result<u8> {
        let if_nbr = self.config(cfg_nbr)?.interfaces.len();
        if if_nbr > usize::from(u8::MAX) {
            return Err(Error::InvalidParameter("interface number"));
        }
        if self.interfaces.is_full() || self.alts.is_full() || !self.strings.has_room_for(&[name]) {
            return Err(Error::AllocationExhausted);
        }
        if let Some(name) = name {
            self.strings.add(name)?;
        }

        let alt = self.alts.alloc(AltInterface {
            arg: alt_arg,
            name: name.map(str::to_string),
            ep_map: EndpointMap::CTRL_ALLOC,
            endpoints: BTreeMap::new(),
        })?;
        let mut alts = SmallVec::new();
        alts.push(alt);
        let handle = self.interfaces.alloc(Interface {
            class,
            sub_class,
            protocol,
            driver,
            arg: if_arg,
            alts,
            alt_cur: 0,
            group: None,
            ep_map: EndpointMap::CTRL_ALLOC,
        })?;
        self.config_mut(cfg_nbr)?.interfaces.push(handle);
        Ok(if_nbr as u8)
    }

    pub fn add_alt_interface(
        &mut self,
        cfg_nbr: u8,
        if_nbr: u8,
        alt_arg: Option<ClassArg>,
        name: Option<&str>,
    ) -> Result<u8> {
        let if_handle = self.interface_handle(cfg_nbr, if_nbr)?;
        let alt_nbr = self.interfaces[if_handle].alts.len();
        if alt_nbr > usize::from(u8::MAX) {
            return Err(Error::InvalidParameter("alternate setting number"));
        }
        if self.alts.is_full() || !self.strings.has_room_for(&[name]) {
            return Err(Error::AllocationExhausted);
        }
        if let Some(name) = name {
            self.strings.add(name)?;
        }

        let handle = self.alts.alloc(AltInterface {
            arg: alt_arg,
            name: name.map(str::to_string),
            ep_map: EndpointMap::CTRL_ALLOC,
            endpoints: BTreeMap::new(),
        })?;
        self.interfaces[if_handle].alts.push(handle);
        Ok(alt_nbr as u8)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_interface_group(
        &mut self,
        cfg_nbr: u8,
        class: u8,
        sub_class: u8,
        protocol: u8,
        first: u8,
        count: u8,
        name: Option<&str>,
    ) -> Result<u8> {
        let config = self.config(cfg_nbr)?;
        if count == 0 || usize::from(first) + usize::from(count) > config.interfaces.len() {
            return Err(Error::InvalidParameter("interface range"));
        }
        let members: SmallVec<[usize; 4]> = config.interfaces
            [usize::from(first)..usize::from(first) + usize::from(count)]
            .iter()
            .copied()
            .collect();
        if members.iter().any(|&handle| self.interfaces[handle].group.is_some()) {
            return Err(Error::AlreadyExists);
        }
        let group_nbr = config.groups.len() as u8;
        if self.groups.is_full() || !self.strings.has_room_for(&[name]) {
            return Err(Error::AllocationExhausted);
        }
        if let Some(name) = name {
            self.strings.add(name)?;
        }

        let handle = self.groups.alloc(InterfaceGroup {
            class,
            sub_class,
            protocol,
            first,
            count,
            name: name.map(str::to_string),
        })?;
        for member in members {
            self.interfaces[member].group = Some(group_nbr);
        }
        self.config_mut(cfg_nbr)?.groups.push(handle);
        Ok(group_nbr)
    }

    /// Reserves a physical endpoint for a new logical endpoint of an alternate setting.
    ///
    /// The candidate set excludes every physical endpoint already used anywhere in the
    /// configuration, so alternate settings never share an endpoint besides the control pipe.
    #[allow(clippy::too_many_arguments)]
    fn add_endpoint(
        &mut self,
        table: &[EndpointCapability],
        cfg_nbr: u8,
        if_nbr: u8,
        alt_nbr: u8,
        ty: EndpointTy,
        dir_in: bool,
        attributes: u8,
        max_packet_size: u16,
        interval: u8,
    ) -> Result<u8> {
        let if_handle = self.interface_handle(cfg_nbr, if_nbr)?;
        let alt_handle = self.alt_handle(cfg_nbr, if_nbr, alt_nbr)?;
        if self.infos.is_full() {
            return Err(Error::AllocationExhausted);
        }

        let used = self.config(cfg_nbr)?.ep_map.union(self.alts[alt_handle].ep_map);
        let allocation = alloc::allocate(
            table,
            used,
            config_speed(cfg_nbr),
            ty,
            dir_in,
            max_packet_size & 0x7FF,
            alt_nbr,
        )?;

        let info = self.infos.alloc(EndpointInfo {
            address: allocation.address,
            attributes,
            max_packet_size: allocation.max_packet_size | (max_packet_size & 0x1800),
            interval,
            sync_address: 0,
            sync_refresh: 0,
        })?;

        let alt = &mut self.alts[alt_handle];
        alt.ep_map.set(allocation.slot);
        let phy = endpoint_addr_to_phy(allocation.address);
        alt.endpoints.insert(phy, info);
        let alt_map = alt.ep_map;

        let interface = &mut self.interfaces[if_handle];
        interface.ep_map = interface.ep_map.union(alt_map);
        let if_map = interface.ep_map;

        let config = self.config_mut(cfg_nbr)?;
        config.ep_map = config.ep_map.union(if_map);

        self.max_phy = self.max_phy.max(phy + 1);
        Ok(allocation.address)
    }

    pub fn add_bulk_endpoint(
        &mut self,
        table: &[EndpointCapability],
        cfg_nbr: u8,
        if_nbr: u8,
        alt_nbr: u8,
        dir_in: bool,
        max_packet_size: u16,
    ) -> Result<u8> {
        let valid = match config_speed(cfg_nbr) {
            Speed::High => matches!(max_packet_size, 0 | 512),
            _ => matches!(max_packet_size, 0 | 8 | 16 | 32 | 64),
        };
        if !valid {
            return Err(Error::InvalidParameter("max_packet_size"));
        }
        self.add_endpoint(
            table,
            cfg_nbr,
            if_nbr,
            alt_nbr,
            EndpointTy::Bulk,
            dir_in,
            EndpointTy::Bulk as u8,
            max_packet_size,
            0,
        )
    }

    /// `interval` is in frames at full speed and in microframes at high speed.
    #[allow(clippy::too_many_arguments)]
    pub fn add_interrupt_endpoint(
        &mut self,
        table: &[EndpointCapability],
        cfg_nbr: u8,
        if_nbr: u8,
        alt_nbr: u8,
        dir_in: bool,
        max_packet_size: u16,
        interval: u16,
    ) -> Result<u8> {
        if interval == 0 {
            return Err(Error::InvalidParameter("interval"));
        }
        let code = match config_speed(cfg_nbr) {
            Speed::High => {
                if alt_nbr == 0 && max_packet_size > 64 {
                    return Err(Error::InvalidParameter("max_packet_size"));
                }
                if max_packet_size > 1024 {
                    return Err(Error::InvalidParameter("max_packet_size"));
                }
                encode_interval(interval)?
            }
            _ => {
                if max_packet_size > 64 {
                    return Err(Error::InvalidParameter("max_packet_size"));
                }
                if interval >= 255 {
                    return Err(Error::InvalidParameter("interval"));
                }
                interval as u8
            }
        };
        self.add_endpoint(
            table,
            cfg_nbr,
            if_nbr,
            alt_nbr,
            EndpointTy::Interrupt,
            dir_in,
            EndpointTy::Interrupt as u8,
            max_packet_size,
            code,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_isochronous_endpoint(
        &mut self,
        table: &[EndpointCapability],
        cfg_nbr: u8,
        if_nbr: u8,
        alt_nbr: u8,
        dir_in: bool,
        attributes: u8,
        max_packet_size: u16,
        transactions: u8,
        interval: u16,
    ) -> Result<u8> {
        if alt_nbr == 0 && max_packet_size > 0 {
            return Err(Error::InvalidParameter("isochronous bandwidth on the default alt"));
        }
        if attributes & !(ENDP_ATTR_SYNC_MASK | ENDP_ATTR_USAGE_MASK) != 0 {
            return Err(Error::InvalidParameter("attributes"));
        }
        let valid_size = match config_speed(cfg_nbr) {
            Speed::High => match transactions {
                1 => max_packet_size <= 1024,
                2 => (513..=1024).contains(&max_packet_size),
                3 => (683..=1024).contains(&max_packet_size),
                _ => false,
            },
            _ => max_packet_size <= 1023 && transactions == 1,
        };
        if !valid_size {
            return Err(Error::InvalidParameter("max_packet_size"));
        }
        let sync = attributes & ENDP_ATTR_SYNC_MASK;
        let usage = attributes & ENDP_ATTR_USAGE_MASK;
        if usage == ISOC_USAGE_FEEDBACK && sync != ISOC_SYNC_NONE {
            return Err(Error::InvalidParameter("feedback endpoints have no synchronisation"));
        }
        let code = encode_interval(interval)?;

        let max_packet_size = (u16::from(transactions - 1) << 11) | max_packet_size;
        self.add_endpoint(
            table,
            cfg_nbr,
            if_nbr,
            alt_nbr,
            EndpointTy::Isoch,
            dir_in,
            EndpointTy::Isoch as u8 | attributes,
            max_packet_size,
            code,
        )
    }

    fn audio_interface(&self, cfg_nbr: u8, if_nbr: u8) -> Result<()> {
        let interface = self.interface(cfg_nbr, if_nbr)?;
        if interface.class != CLASS_AUDIO || interface.protocol != 0 {
            return Err(Error::InvalidParameter("not an audio 1.0 interface"));
        }
        Ok(())
    }

    fn find_info(&self, cfg_nbr: u8, if_nbr: u8, alt_nbr: u8, address: u8) -> Result<Option<usize>> {
        let alt = self.alt(cfg_nbr, if_nbr, alt_nbr)?;
        Ok(alt
            .endpoints
            .get(&endpoint_addr_to_phy(address))
            .copied()
            .filter(|&info| self.infos[info].address == address))
    }

    pub fn set_isochronous_refresh_rate(
        &mut self,
        cfg_nbr: u8,
        if_nbr: u8,
        alt_nbr: u8,
        sync_ep_addr: u8,
        refresh: u8,
    ) -> Result<()> {
        if !(1..=9).contains(&refresh) {
            return Err(Error::InvalidParameter("refresh"));
        }
        self.audio_interface(cfg_nbr, if_nbr)?;
        let handle = self
            .find_info(cfg_nbr, if_nbr, alt_nbr, sync_ep_addr)?
            .ok_or(Error::InvalidHandle)?;

        let info = &mut self.infos[handle];
        let feedback = info.ty() == EndpointTy::Isoch
            && info.attributes & ENDP_ATTR_SYNC_MASK == ISOC_SYNC_NONE
            && info.attributes & ENDP_ATTR_USAGE_MASK == ISOC_USAGE_FEEDBACK
            && info.sync_address == 0;
        if !feedback {
            return Err(Error::InvalidParameter("not a feedback endpoint"));
        }
        info.sync_refresh = refresh;
        Ok(())
    }

    pub fn set_isochronous_sync_address(
        &mut self,
        cfg_nbr: u8,
        if_nbr: u8,
        alt_nbr: u8,
        data_ep_addr: u8,
        sync_addr: u8,
    ) -> Result<()> {
        self.audio_interface(cfg_nbr, if_nbr)?;
        let handle = self
            .find_info(cfg_nbr, if_nbr, alt_nbr, data_ep_addr)?
            .ok_or(Error::InvalidHandle)?;
        if self.find_info(cfg_nbr, if_nbr, alt_nbr, sync_addr)?.is_none() {
            return Err(Error::InvalidParameter("sync endpoint"));
        }

        let info = &mut self.infos[handle];
        let sync = info.attributes & ENDP_ATTR_SYNC_MASK;
        let needs_feedback = (sync == ISOC_SYNC_ASYNC && !endpoint_is_in(info.address))
            || (sync == ISOC_SYNC_ADAPTIVE && endpoint_is_in(info.address));
        let data = info.ty() == EndpointTy::Isoch
            && info.attributes & ENDP_ATTR_USAGE_MASK == ISOC_USAGE_DATA
            && info.sync_refresh == 0;
        if !(data && needs_feedback) {
            return Err(Error::InvalidParameter("not a data endpoint needing feedback"));
        }
        info.sync_address = sync_addr;
        Ok(())
    }

    pub fn snapshot(&self, cfg_nbr: u8) -> Result<ConfigSnapshot> {
        let config = self.config(cfg_nbr)?;
        let name_idx = |name: &Option<String>| name.as_deref().map(|n| self.strings.index(n)).unwrap_or(0);

        let interfaces = config
            .interfaces
            .iter()
            .enumerate()
            .map(|(if_nbr, &handle)| {
                let interface = &self.interfaces[handle];
                let alts = interface
                    .alts
                    .iter()
                    .enumerate()
                    .map(|(alt_nbr, &alt)| {
                        let alt = &self.alts[alt];
                        AltSnapshot {
                            nbr: alt_nbr as u8,
                            arg: alt.arg.clone(),
                            name_idx: name_idx(&alt.name),
                            endpoints: alt.endpoints.values().map(|&info| self.infos[info]).collect(),
                        }
                    })
                    .collect();
                InterfaceSnapshot {
                    nbr: if_nbr as u8,
                    class: interface.class,
                    sub_class: interface.sub_class,
                    protocol: interface.protocol,
                    driver: Arc::clone(&interface.driver),
                    arg: interface.arg.clone(),
                    alt_cur: interface.alt_cur,
                    group: interface.group,
                    alts,
                }
            })
            .collect();

        let groups = config
            .groups
            .iter()
            .map(|&handle| {
                let group = &self.groups[handle];
                GroupSnapshot {
                    class: group.class,
                    sub_class: group.sub_class,
                    protocol: group.protocol,
                    first: group.first,
                    count: group.count,
                    name_idx: name_idx(&group.name),
                }
            })
            .collect();

        Ok(ConfigSnapshot {
            nbr: cfg_nbr,
            attributes: config.attributes,
            max_power: config.max_power,
            name_idx: name_idx(&config.name),
            interfaces,
            groups,
        })
    }
}

/// Encodes a power-of-two period as `log2(interval) + 1`.
fn encode_interval(interval: u16) -> Result<u8> {
    if interval == 0 || !interval.is_power_of_two() {
        return Err(Error::InvalidParameter("interval"));
    }
    Ok(interval.trailing_zeros() as u8 + 1)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::CoreConfig;
    use driver_udc::sim::SimUDC;

    struct Nop;
    impl ClassDriver for Nop {}

    fn registry() -> Registry {
        Registry::new(&CoreConfig::default_config().pools)
    }

    #[test]
    fn interval_encoding() {
        assert_eq!(encode_interval(1), Ok(1));
        assert_eq!(encode_interval(8), Ok(4));
        assert_eq!(encode_interval(1 << 15), Ok(16));
        assert!(encode_interval(0).is_err());
        assert!(encode_interval(12).is_err());
    }

    #[test]
    fn strings_deduplicate() {
        let mut reg = registry();
        let cfg = reg.add_configuration(Some("Main"), 0, 100, Speed::Full, Speed::Full).unwrap();
        reg.add_interface(cfg, Arc::new(Nop), None, None, 0xFF, 0, 0, Some("Main")).unwrap();
        assert_eq!(reg.strings.index("Main"), 1);
        assert_eq!(reg.strings.get(1), Some("Main"));
        assert_eq!(reg.strings.get(2), None);
    }

    #[test]
    fn high_speed_needs_capable_controller() {
        let mut reg = registry();
        assert_eq!(
            reg.add_configuration(None, 0, 100, Speed::High, Speed::Full),
            Err(Error::InvalidParameter("speed"))
        );
        let cfg = reg.add_configuration(None, 0, 100, Speed::High, Speed::High).unwrap();
        assert_eq!(cfg, CONFIG_NBR_SPD_BIT);
        assert_eq!(reg.config_count(Speed::High), 1);
        assert_eq!(reg.config_count(Speed::Full), 0);
    }

    #[test]
    fn groups_cannot_overlap() {
        let mut reg = registry();
        let cfg = reg.add_configuration(None, 0, 100, Speed::Full, Speed::Full).unwrap();
        for _ in 0..3 {
            reg.add_interface(cfg, Arc::new(Nop), None, None, 2, 2, 1, None).unwrap();
        }
        assert_eq!(
            reg.add_interface_group(cfg, 2, 2, 1, 2, 2, None),
            Err(Error::InvalidParameter("interface range"))
        );
        assert_eq!(reg.add_interface_group(cfg, 2, 2, 1, 0, 2, None), Ok(0));
        assert_eq!(reg.add_interface_group(cfg, 2, 2, 1, 1, 2, None), Err(Error::AlreadyExists));
        assert_eq!(reg.interface(cfg, 1).unwrap().group, Some(0));
        assert_eq!(reg.interface(cfg, 2).unwrap().group, None);
    }

    #[test]
    fn isochronous_validation() {
        let table = SimUDC::endpoint_table_for(Speed::High, 4);
        let mut reg = registry();
        let cfg = reg.add_configuration(None, 0, 100, Speed::High, Speed::High).unwrap();
        let intf = reg.add_interface(cfg, Arc::new(Nop), None, None, CLASS_AUDIO, 2, 0, None).unwrap();
        let alt = reg.add_alt_interface(cfg, intf, None, None).unwrap();

        assert!(reg
            .add_isochronous_endpoint(&table, cfg, intf, 0, true, 0, 64, 1, 1)
            .is_err());
        assert!(reg
            .add_isochronous_endpoint(&table, cfg, intf, alt, true, 0, 512, 3, 1)
            .is_err());
        assert!(reg
            .add_isochronous_endpoint(&table, cfg, intf, alt, true, ISOC_USAGE_FEEDBACK | ISOC_SYNC_ASYNC, 4, 1, 1)
            .is_err());

        let data = reg
            .add_isochronous_endpoint(&table, cfg, intf, alt, false, ISOC_SYNC_ASYNC, 200, 1, 1)
            .unwrap();
        let feedback = reg
            .add_isochronous_endpoint(&table, cfg, intf, alt, true, ISOC_USAGE_FEEDBACK, 4, 1, 8)
            .unwrap();
        assert_eq!(data, 0x01);
        assert_eq!(feedback, 0x81);

        assert_eq!(reg.set_isochronous_refresh_rate(cfg, intf, alt, feedback, 0), Err(Error::InvalidParameter("refresh")));
        reg.set_isochronous_refresh_rate(cfg, intf, alt, feedback, 3).unwrap();
        assert_eq!(reg.set_isochronous_sync_address(cfg, intf, alt, 0x03, feedback), Err(Error::InvalidHandle));
        reg.set_isochronous_sync_address(cfg, intf, alt, data, feedback).unwrap();

        let snapshot = reg.snapshot(cfg).unwrap();
        let eps = &snapshot.interfaces[0].alts[1].endpoints;
        assert_eq!(eps[0].sync_address, feedback);
        assert_eq!(eps[1].sync_refresh, 3);
        assert_eq!(eps[1].interval, 4);
    }

    #[test]
    fn sibling_alts_get_disjoint_endpoints() {
        let table = SimUDC::endpoint_table_for(Speed::Full, 6);
        let mut reg = registry();
        let cfg = reg.add_configuration(None, 0, 100, Speed::Full, Speed::Full).unwrap();
        let intf = reg.add_interface(cfg, Arc::new(Nop), None, None, 0xFF, 0, 0, None).unwrap();
        let alt1 = reg.add_alt_interface(cfg, intf, None, None).unwrap();

        let a = reg.add_bulk_endpoint(&table, cfg, intf, 0, true, 64).unwrap();
        let b = reg.add_bulk_endpoint(&table, cfg, intf, alt1, true, 64).unwrap();
        assert_ne!(a, b);

        let map0 = reg.alt(cfg, intf, 0).unwrap().ep_map;
        let map1 = reg.alt(cfg, intf, alt1).unwrap().ep_map;
        assert_eq!(map0.bits() & map1.bits(), EndpointMap::CTRL_ALLOC.bits());
        assert_eq!(reg.max_phy(), endpoint_addr_to_phy(b) + 1);
    }
}
