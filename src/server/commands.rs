//! Zone protocol line parser and command table.
//!
//! Every request is one line of comma-separated fields; every reply is
//! either a single `OK - ...` / `ERR - ...` line, or a block of such lines
//! terminated by a blank line for commands that return multiple records.

use crate::zone::{Attr, ZoneList};

pub const PROTOCOL_VERSION: u32 = 2;

pub const HELP_TEXT: &str = "\
OK - Commands:
  ver
  help
  bye
  addzone name,xmin,ymin,zmin,xmax,ymax,zmax
  setzone name,xmin,ymin,zmin,xmax,ymax,zmax
  setzone name,attr,value
  rmzone name
  clear
  zones
  sub
  unsub
  getdepth
  subdepth count
  unsubdepth
  getvideo
  getbright
  subbright
  unsubbright
  tilt [degrees]
  fps
  lut
  sa z
";

/// A parsed request line: the command word plus its comma-separated
/// arguments, with surrounding whitespace trimmed from each.
pub struct Request<'a> {
    pub command: &'a str,
    pub args: Vec<&'a str>,
}

impl<'a> Request<'a> {
    pub fn parse(line: &'a str) -> Option<Request<'a>> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return None;
        }
        let mut parts = line.splitn(2, ' ');
        let command = parts.next()?.trim();
        let rest = parts.next().unwrap_or("").trim();
        let args = if rest.is_empty() { Vec::new() } else { rest.split(',').map(str::trim).collect() };
        Some(Request { command, args })
    }
}

fn parse_i32(s: &str) -> Result<i32, String> {
    s.trim().parse().map_err(|_| format!("Invalid integer: {s:?}."))
}

/// Renders a zone's full state as the attribute line the `zones` command
/// emits per zone and the `SUB`/`ADD`/`DEL` fan-out lines carry.
pub fn format_zone_line(z: &crate::zone::Zone) -> String {
    format!(
        "xmin={} ymin={} zmin={} xmax={} ymax={} zmax={} param={} on_level={} off_level={} on_delay={} off_delay={} pop={} occupied={} name=\"{}\"",
        z.xmin,
        z.ymin,
        z.zmin,
        z.xmax,
        z.ymax,
        z.zmax,
        z.param.as_str(),
        z.rising_threshold,
        z.falling_threshold,
        z.rising_delay,
        z.falling_delay,
        z.pop,
        if z.published_occupied() { 1 } else { 0 },
        z.name,
    )
}

pub enum Reply {
    Line(String),
    Block(Vec<String>),
    /// Tells the caller to close the connection after flushing this reply.
    CloseAfter(String),
    /// No protocol reply: the command only changed subscription state.
    None,
}

pub fn ok(msg: impl Into<String>) -> Reply {
    Reply::Line(format!("OK - {}\n", msg.into()))
}

pub fn err(msg: impl std::fmt::Display) -> Reply {
    Reply::Line(format!("ERR - {msg}\n"))
}

/// Side effects a command handler asks the connection loop to perform that
/// aren't simply "write this reply" — these touch state outside the zone
/// list (subscriptions, the frame pipeline, tilt motor).
#[derive(Default)]
pub struct Effects {
    pub set_sub_zones: Option<bool>,
    pub set_sub_depth: Option<i64>,
    pub set_sub_video: Option<bool>,
    pub set_sub_bright: Option<bool>,
    pub request_tilt: Option<i32>,
    pub want_depth_once: bool,
    pub want_video_once: bool,
    /// Attribute line for a zone that was just added, to broadcast as `ADD -`.
    pub broadcast_add: Option<String>,
    /// Attribute lines for zones that were just removed, to broadcast as `DEL -`.
    pub broadcast_del: Option<Vec<String>>,
}

pub struct Dispatch {
    pub reply: Reply,
    pub effects: Effects,
}

fn simple(reply: Reply) -> Dispatch {
    Dispatch { reply, effects: Effects::default() }
}

pub struct CommandContext<'a> {
    pub zones: &'a mut ZoneList,
    pub tilt_degrees: i32,
    pub depth_fps: f64,
    pub video_fps: f64,
    pub busy_count: u64,
}

pub fn dispatch(req: &Request, ctx: &mut CommandContext) -> Dispatch {
    match req.command {
        "ver" => simple(ok(format!("Version {PROTOCOL_VERSION}"))),
        "help" => simple(Reply::Block(HELP_TEXT.lines().map(str::to_string).collect())),
        "bye" => simple(Reply::CloseAfter("OK - Bye.\n".to_string())),

        "addzone" => cmd_addzone(req, ctx.zones),
        "setzone" => simple(cmd_setzone(req, ctx.zones)),
        "rmzone" => cmd_rmzone(req, ctx.zones),
        "clear" => cmd_clear(ctx.zones),
        "zones" => simple(cmd_zones(ctx.zones)),

        "sub" => Dispatch { reply: ok("Subscribed."), effects: Effects { set_sub_zones: Some(true), ..Default::default() } },
        "unsub" => Dispatch { reply: ok("Unsubscribed."), effects: Effects { set_sub_zones: Some(false), ..Default::default() } },

        "getdepth" => Dispatch { reply: Reply::None, effects: Effects { want_depth_once: true, ..Default::default() } },
        "subdepth" => cmd_subdepth(req),
        "unsubdepth" => Dispatch { reply: ok("Unsubscribed from depth."), effects: Effects { set_sub_depth: Some(0), ..Default::default() } },

        "getvideo" => Dispatch { reply: Reply::None, effects: Effects { want_video_once: true, set_sub_video: Some(true), ..Default::default() } },

        "getbright" => simple(cmd_getbright(ctx.zones)),
        "subbright" => Dispatch { reply: ok("Subscribed to brightness."), effects: Effects { set_sub_bright: Some(true), ..Default::default() } },
        "unsubbright" => Dispatch { reply: ok("Unsubscribed from brightness."), effects: Effects { set_sub_bright: Some(false), ..Default::default() } },

        "tilt" => cmd_tilt(req, ctx.tilt_degrees),
        "fps" => simple(ok(format!("depth={:.2} video={:.2} busy={}", ctx.depth_fps, ctx.video_fps, ctx.busy_count))),

        "lut" => simple(cmd_lut()),
        "sa" => simple(cmd_sa(req)),

        other => simple(err(format!("Unknown command: {other:?}."))),
    }
}

fn cmd_addzone(req: &Request, zones: &mut ZoneList) -> Dispatch {
    if req.args.len() != 7 {
        return simple(err("addzone requires name,xmin,ymin,zmin,xmax,ymax,zmax"));
    }
    let name = req.args[0];
    let nums: Result<Vec<i32>, String> = req.args[1..7].iter().map(|s| parse_i32(s)).collect();
    let nums = match nums {
        Ok(n) => n,
        Err(e) => return simple(err(e)),
    };
    match zones.add(name, nums[0], nums[1], nums[2], nums[3], nums[4], nums[5]) {
        Ok(()) => {
            let line = zones.find(name).map(format_zone_line);
            Dispatch {
                reply: ok(format!("Zone \"{name}\" added.")),
                effects: Effects { broadcast_add: line, ..Default::default() },
            }
        }
        Err(e) => simple(err(e)),
    }
}

fn cmd_setzone(req: &Request, zones: &mut ZoneList) -> Reply {
    if req.args.len() == 7 {
        let name = req.args[0];
        let nums: Result<Vec<i32>, String> = req.args[1..7].iter().map(|s| parse_i32(s)).collect();
        let nums = match nums {
            Ok(n) => n,
            Err(e) => return err(e),
        };
        return match zones.set(name, nums[0], nums[1], nums[2], nums[3], nums[4], nums[5]) {
            Ok(()) => ok(format!("Zone \"{name}\" updated.")),
            Err(e) => err(e),
        };
    }
    if req.args.len() == 3 {
        let name = req.args[0];
        let attr = match Attr::parse(req.args[1]) {
            Some(a) => a,
            None => return err(format!("Unknown attribute: {:?}.", req.args[1])),
        };
        return match zones.set_attr(name, attr, req.args[2]) {
            Ok(()) => ok(format!("Zone \"{name}\" updated.")),
            Err(e) => err(e),
        };
    }
    err("setzone requires either 7 fields (bounds) or 3 fields (name,attr,value)")
}

fn cmd_rmzone(req: &Request, zones: &mut ZoneList) -> Dispatch {
    if req.args.len() != 1 {
        return simple(err("rmzone requires exactly one field: name"));
    }
    match zones.rm(req.args[0]) {
        Ok(z) => {
            let line = format_zone_line(&z);
            Dispatch {
                reply: ok(format!("Zone \"{}\" removed.", z.name)),
                effects: Effects { broadcast_del: Some(vec![line]), ..Default::default() },
            }
        }
        Err(e) => simple(err(e)),
    }
}

fn cmd_clear(zones: &mut ZoneList) -> Dispatch {
    let lines: Vec<String> = zones.zones().iter().map(format_zone_line).collect();
    zones.clear();
    Dispatch {
        reply: ok("Cleared."),
        effects: Effects {
            broadcast_del: if lines.is_empty() { None } else { Some(lines) },
            ..Default::default()
        },
    }
}

fn cmd_zones(zones: &ZoneList) -> Reply {
    let header = match zones.peak() {
        Some(p) => format!(
            "OK - {} zones - Version {}, {} occupied, peak zone is {} \"{}\"",
            zones.len(),
            zones.version(),
            zones.occupied_count(),
            p.index,
            p.name
        ),
        None => format!(
            "OK - {} zones - Version {}, {} occupied, peak zone is -1 \"\"",
            zones.len(),
            zones.version(),
            zones.occupied_count()
        ),
    };
    let mut lines = vec![header];
    lines.extend(zones.zones().iter().map(format_zone_line));
    Reply::Block(lines)
}

fn cmd_subdepth(req: &Request) -> Dispatch {
    let limit = if req.args.is_empty() || req.args[0].is_empty() {
        -1i64
    } else {
        match req.args[0].trim().parse::<i64>() {
            Ok(n) if n > 0 => n,
            _ => return simple(err("subdepth count must be a positive integer, or omitted for unlimited")),
        }
    };
    Dispatch { reply: ok("Subscribed to depth."), effects: Effects { set_sub_depth: Some(limit), ..Default::default() } }
}

fn cmd_getbright(zones: &ZoneList) -> Reply {
    let total: i64 = zones.zones().iter().map(|z| z.bright() as i64).sum();
    let n = zones.len().max(1) as i64;
    ok((total / n).to_string())
}

fn cmd_tilt(req: &Request, current: i32) -> Dispatch {
    if req.args.is_empty() || req.args[0].is_empty() {
        return simple(ok(current.to_string()));
    }
    match req.args[0].trim().parse::<i32>() {
        Ok(degrees) if (-15..=15).contains(&degrees) => {
            Dispatch { reply: ok(degrees.to_string()), effects: Effects { request_tilt: Some(degrees), ..Default::default() } }
        }
        Ok(_) => simple(err("tilt must be between -15 and 15 degrees")),
        Err(_) => simple(err("tilt requires an integer degree value")),
    }
}

fn cmd_lut() -> Reply {
    let mut lines = vec!["OK - 2048 entries.".to_string()];
    for d in 0u16..2048 {
        lines.push(format!("{},{}", d, crate::lut::depth_lut(d)));
    }
    Reply::Block(lines)
}

fn cmd_sa(req: &Request) -> Reply {
    if req.args.len() != 1 {
        return err("sa requires exactly one field: z (millimetres)");
    }
    let z: f32 = match req.args[0].trim().parse() {
        Ok(v) => v,
        Err(_) => return err(format!("Invalid number: {:?}.", req.args[0])),
    };
    ok(crate::lut::surface_area(z).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zone::ZoneList;

    fn ctx(zones: &mut ZoneList) -> CommandContext<'_> {
        CommandContext { zones, tilt_degrees: 0, depth_fps: 0.0, video_fps: 0.0, busy_count: 0 }
    }

    #[test]
    fn parse_splits_command_and_comma_args() {
        let req = Request::parse("addzone door,1,2,3,4,5,6\n").unwrap();
        assert_eq!(req.command, "addzone");
        assert_eq!(req.args, vec!["door", "1", "2", "3", "4", "5", "6"]);
    }

    #[test]
    fn parse_handles_bare_command_with_no_args() {
        let req = Request::parse("zones\r\n").unwrap();
        assert_eq!(req.command, "zones");
        assert!(req.args.is_empty());
    }

    #[test]
    fn addzone_then_zones_round_trips() {
        let mut zones = ZoneList::new(2, 2);
        let req = Request::parse("addzone door,-500,-500,400,500,500,2000").unwrap();
        let d = dispatch(&req, &mut ctx(&mut zones));
        assert!(matches!(d.reply, Reply::Line(s) if s.starts_with("OK -")));

        let req = Request::parse("zones").unwrap();
        let d = dispatch(&req, &mut ctx(&mut zones));
        match d.reply {
            Reply::Block(lines) => {
                assert!(lines[0].starts_with("OK - 1 zones - Version"));
                assert!(lines[1].contains("name=\"door\""));
            }
            _ => panic!("expected block reply"),
        }
    }

    #[test]
    fn unknown_command_is_an_error() {
        let mut zones = ZoneList::new(2, 2);
        let req = Request::parse("frobnicate").unwrap();
        let d = dispatch(&req, &mut ctx(&mut zones));
        assert!(matches!(d.reply, Reply::Line(s) if s.starts_with("ERR -")));
    }

    #[test]
    fn tilt_out_of_range_is_rejected_without_side_effects() {
        let mut zones = ZoneList::new(2, 2);
        let req = Request::parse("tilt 45").unwrap();
        let d = dispatch(&req, &mut ctx(&mut zones));
        assert!(matches!(d.reply, Reply::Line(s) if s.starts_with("ERR -")));
        assert!(d.effects.request_tilt.is_none());
    }

    #[test]
    fn bye_closes_after_sending_reply() {
        let mut zones = ZoneList::new(2, 2);
        let req = Request::parse("bye").unwrap();
        let d = dispatch(&req, &mut ctx(&mut zones));
        assert!(matches!(d.reply, Reply::CloseAfter(_)));
    }
}
