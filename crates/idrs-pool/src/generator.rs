//! Synthesises resource profiles.
//!
//! Every draw comes from the RNG stream seeded by the resource id, so the
//! same id (and salt) always yields the same profile.

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::rngs::StdRng;
use std::sync::Arc;

use idrs_config::ProxyUpstream;
use idrs_core::regions::{self, RegionInfo};
use idrs_core::{
    DeviceProfile, EngineError, EngineResult, Geolocation, ProxyProfile, Resource, ResourceId,
    ResourceKind, ResourceProfile, RngSource, RotationStrategy, ScreenProfile,
    SessionIdentityProfile,
};

/// Maximum offset from a region's reference point, in degrees.
const GEO_JITTER_DEG: f64 = 0.3;

/// Constraints for a new resource.
#[derive(Clone, Debug, Default)]
pub struct ResourceHints {
    /// Required region (ISO alpha-2).
    pub region: Option<String>,
    /// Region the new resource must not be in. Ignored when `region` is set
    /// to something else.
    pub avoid_region: Option<String>,
    /// Device a new session identity links to and inherits from.
    pub linked_device: Option<Resource>,
}

impl ResourceHints {
    pub fn region(region: impl Into<String>) -> Self {
        Self {
            region: Some(region.into()),
            ..Default::default()
        }
    }
}

struct DeviceTemplate {
    platform: &'static str,
    os_token: &'static str,
    webgl_vendor: &'static str,
    webgl_renderers: &'static [&'static str],
    screens: &'static [(u32, u32, f64)],
    cores: &'static [u8],
    memory_gb: &'static [u8],
}

const DEVICE_TEMPLATES: &[DeviceTemplate] = &[
    DeviceTemplate {
        platform: "Win32",
        os_token: "Windows NT 10.0; Win64; x64",
        webgl_vendor: "Google Inc. (NVIDIA)",
        webgl_renderers: &[
            "ANGLE (NVIDIA, NVIDIA GeForce RTX 3060 Direct3D11 vs_5_0 ps_5_0, D3D11)",
            "ANGLE (NVIDIA, NVIDIA GeForce GTX 1660 SUPER Direct3D11 vs_5_0 ps_5_0, D3D11)",
            "ANGLE (Intel, Intel(R) UHD Graphics 630 Direct3D11 vs_5_0 ps_5_0, D3D11)",
        ],
        screens: &[(1920, 1080, 1.0), (2560, 1440, 1.0), (1366, 768, 1.0), (1536, 864, 1.25)],
        cores: &[4, 6, 8, 12, 16],
        memory_gb: &[4, 8, 16],
    },
    DeviceTemplate {
        platform: "MacIntel",
        os_token: "Macintosh; Intel Mac OS X 10_15_7",
        webgl_vendor: "Apple Inc.",
        webgl_renderers: &["Apple M1", "Apple M2", "Apple M3"],
        screens: &[(1440, 900, 2.0), (1512, 982, 2.0), (1728, 1117, 2.0)],
        cores: &[8, 10, 12],
        memory_gb: &[8, 16],
    },
    DeviceTemplate {
        platform: "Linux x86_64",
        os_token: "X11; Linux x86_64",
        webgl_vendor: "Google Inc. (Mesa)",
        webgl_renderers: &[
            "ANGLE (AMD, AMD Radeon RX 6600 (radeonsi), OpenGL 4.6)",
            "ANGLE (Intel, Mesa Intel(R) Xe Graphics (TGL GT2), OpenGL 4.6)",
        ],
        screens: &[(1920, 1080, 1.0), (2560, 1440, 1.0)],
        cores: &[4, 8, 16],
        memory_gb: &[8, 16],
    },
];

const CHROME_MAJOR_VERSIONS: std::ops::RangeInclusive<u32> = 124..=130;

fn pick<'a, T>(rng: &mut StdRng, items: &'a [T]) -> Option<&'a T> {
    if items.is_empty() {
        return None;
    }
    items.get(rng.gen_range(0..items.len()))
}

fn user_agent(os_token: &str, major: u32) -> String {
    format!(
        "Mozilla/5.0 ({os_token}) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{major}.0.0.0 Safari/537.36"
    )
}

pub struct ProfileGenerator {
    upstreams: Vec<ProxyUpstream>,
    rng: Arc<dyn RngSource>,
}

impl ProfileGenerator {
    pub fn new(upstreams: Vec<ProxyUpstream>, rng: Arc<dyn RngSource>) -> Self {
        Self { upstreams, rng }
    }

    pub fn upstreams(&self) -> &[ProxyUpstream] {
        &self.upstreams
    }

    /// Build a fresh resource with the given id.
    pub fn generate(
        &self,
        id: ResourceId,
        kind: ResourceKind,
        hints: &ResourceHints,
        strategy: RotationStrategy,
        now: DateTime<Utc>,
    ) -> EngineResult<Resource> {
        let mut rng = self.rng.for_resource(&id);
        let (profile, geolocation) = match kind {
            ResourceKind::Proxy => self.proxy(&mut rng, &id, hints)?,
            ResourceKind::Device => device(&mut rng, hints)?,
            ResourceKind::SessionIdentity => session_identity(&mut rng, hints)?,
        };
        Ok(Resource::new(id, profile, Some(geolocation), strategy, now))
    }

    fn proxy(
        &self,
        rng: &mut StdRng,
        id: &ResourceId,
        hints: &ResourceHints,
    ) -> EngineResult<(ResourceProfile, Geolocation)> {
        let kind = ResourceKind::Proxy;
        if self.upstreams.is_empty() {
            return Err(EngineError::Generation {
                kind,
                reason: "no proxy upstreams configured".into(),
            });
        }
        let servable: Vec<&'static RegionInfo> = regions::all()
            .iter()
            .filter(|r| self.upstreams.iter().any(|u| u.serves(r.code)))
            .collect();
        let region = resolve_region(rng, kind, hints, &servable)?;
        let candidates: Vec<&ProxyUpstream> = self
            .upstreams
            .iter()
            .filter(|u| u.serves(region.code))
            .collect();
        let Some(upstream) = pick(rng, &candidates) else {
            return Err(EngineError::Generation {
                kind,
                reason: format!("no upstream serves region '{}'", region.code),
            });
        };

        let profile = ProxyProfile {
            host: upstream.host.clone(),
            port: upstream.port,
            username: upstream
                .username
                .as_ref()
                .map(|u| format!("{u}-session-{}", id.short().to_ascii_lowercase())),
            password: upstream.password.clone(),
            country: region.code.to_string(),
            protocol: upstream.protocol,
        };
        Ok((ResourceProfile::Proxy(profile), jittered(rng, region)))
    }
}

fn device(rng: &mut StdRng, hints: &ResourceHints) -> EngineResult<(ResourceProfile, Geolocation)> {
    let kind = ResourceKind::Device;
    let region = resolve_region(rng, kind, hints, &regions::all().iter().collect::<Vec<_>>())?;
    let template = pick(rng, DEVICE_TEMPLATES).ok_or_else(|| EngineError::Generation {
        kind,
        reason: "no device templates".into(),
    })?;

    let major = rng.gen_range(CHROME_MAJOR_VERSIONS);
    let &(width, height, pixel_ratio) = pick(rng, template.screens).unwrap_or(&(1920, 1080, 1.0));
    let profile = DeviceProfile {
        platform: template.platform.to_string(),
        user_agent: user_agent(template.os_token, major),
        browser_version: format!("{major}.0"),
        screen: ScreenProfile {
            width,
            height,
            pixel_ratio,
        },
        hardware_concurrency: pick(rng, template.cores).copied().unwrap_or(8),
        device_memory_gb: pick(rng, template.memory_gb).copied().unwrap_or(8),
        timezone: pick(rng, region.timezones)
            .copied()
            .unwrap_or("UTC")
            .to_string(),
        locale: region.locale.to_string(),
        languages: region.languages.iter().map(|l| l.to_string()).collect(),
        webgl_vendor: template.webgl_vendor.to_string(),
        webgl_renderer: pick(rng, template.webgl_renderers)
            .copied()
            .unwrap_or_default()
            .to_string(),
        fingerprint_seed: rng.gen_range(0..u64::MAX),
    };
    Ok((ResourceProfile::Device(profile), jittered(rng, region)))
}

fn session_identity(
    rng: &mut StdRng,
    hints: &ResourceHints,
) -> EngineResult<(ResourceProfile, Geolocation)> {
    let kind = ResourceKind::SessionIdentity;
    if let Some(device) = &hints.linked_device {
        let ResourceProfile::Device(profile) = &device.profile else {
            return Err(EngineError::Generation {
                kind,
                reason: format!("linked resource '{}' is not a device", device.id),
            });
        };
        if let (Some(wanted), Some(actual)) = (hints.region.as_deref(), device.region())
            && !wanted.eq_ignore_ascii_case(actual)
        {
            return Err(EngineError::Generation {
                kind,
                reason: format!(
                    "requested region '{wanted}' contradicts linked device region '{actual}'"
                ),
            });
        }
        let geolocation = match &device.geolocation {
            Some(geo) => geo.clone(),
            None => {
                let region = resolve_region(rng, kind, hints, &regions::all().iter().collect::<Vec<_>>())?;
                jittered(rng, region)
            }
        };
        let identity = SessionIdentityProfile {
            device_id: Some(device.id.clone()),
            user_agent: profile.user_agent.clone(),
            locale: profile.locale.clone(),
            timezone: profile.timezone.clone(),
        };
        return Ok((ResourceProfile::SessionIdentity(identity), geolocation));
    }

    let region = resolve_region(rng, kind, hints, &regions::all().iter().collect::<Vec<_>>())?;
    let template = pick(rng, DEVICE_TEMPLATES).ok_or_else(|| EngineError::Generation {
        kind,
        reason: "no device templates".into(),
    })?;
    let identity = SessionIdentityProfile {
        device_id: None,
        user_agent: user_agent(template.os_token, rng.gen_range(CHROME_MAJOR_VERSIONS)),
        locale: region.locale.to_string(),
        timezone: pick(rng, region.timezones)
            .copied()
            .unwrap_or("UTC")
            .to_string(),
    };
    Ok((ResourceProfile::SessionIdentity(identity), jittered(rng, region)))
}

/// Pick the region a new resource lives in.
fn resolve_region(
    rng: &mut StdRng,
    kind: ResourceKind,
    hints: &ResourceHints,
    allowed: &[&'static RegionInfo],
) -> EngineResult<&'static RegionInfo> {
    if let Some(code) = hints.region.as_deref() {
        let Some(region) = regions::lookup(code) else {
            return Err(EngineError::Generation {
                kind,
                reason: format!("unsupported region '{code}'"),
            });
        };
        if hints
            .avoid_region
            .as_deref()
            .is_some_and(|avoid| avoid.eq_ignore_ascii_case(code))
        {
            return Err(EngineError::Generation {
                kind,
                reason: format!("region '{code}' is both required and excluded"),
            });
        }
        if !allowed.iter().any(|r| r.code == region.code) {
            return Err(EngineError::Generation {
                kind,
                reason: format!("no upstream serves region '{}'", region.code),
            });
        }
        return Ok(region);
    }

    let choices: Vec<&'static RegionInfo> = allowed
        .iter()
        .copied()
        .filter(|r| {
            hints
                .avoid_region
                .as_deref()
                .is_none_or(|avoid| !avoid.eq_ignore_ascii_case(r.code))
        })
        .collect();
    // Only the avoided region is available: better the same region than none.
    let pool: &[&RegionInfo] = if choices.is_empty() { allowed } else { &choices[..] };
    pick(rng, pool).copied().ok_or_else(|| EngineError::Generation {
        kind,
        reason: "no region available".into(),
    })
}

fn jittered(rng: &mut StdRng, region: &RegionInfo) -> Geolocation {
    Geolocation {
        latitude: region.latitude + rng.gen_range(-GEO_JITTER_DEG..=GEO_JITTER_DEG),
        longitude: region.longitude + rng.gen_range(-GEO_JITTER_DEG..=GEO_JITTER_DEG),
        region: region.code.to_string(),
    }
}
